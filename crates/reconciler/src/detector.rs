//! State transition detection for essential containers.
//!
//! Watches fire an update for nearly every resource version bump of a pod,
//! so the filter lives here: only the one transition that triggers a delete
//! ever reaches the work queue.

use crate::error::{Error, Result};
use crate::types::{Event, PodSnapshot, is_successful_completion};

/// Read the essential container name from the pod's designation label.
///
/// # Errors
///
/// Returns [`Error::DesignationMissing`] if the label is absent or empty.
pub fn designation<'a>(pod: &'a PodSnapshot, label_key: &str) -> Result<&'a str> {
    pod.label(label_key)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::designation_missing(&pod.name, &pod.namespace, label_key))
}

/// Compare two snapshots of the same pod and decide whether `designated`
/// just completed successfully.
///
/// Returns `Ok(Some(event))` only for Running -> Terminated with reason
/// `"Completed"`. Missing container statuses count as Unknown.
///
/// # Errors
///
/// Returns [`Error::ContainerNotDeclared`] when `designated` is not one of
/// the containers declared in `new`'s spec.
pub fn detect(old: &PodSnapshot, new: &PodSnapshot, designated: &str) -> Result<Option<Event>> {
    if !new.declares(designated) {
        return Err(Error::container_not_declared(
            &old.name,
            &old.namespace,
            designated,
        ));
    }

    let old_state = old.container_state(designated);
    let new_state = new.container_state(designated);

    if !is_successful_completion(old_state.phase, new_state.phase, new_state.reason_or_empty()) {
        return Ok(None);
    }

    Ok(Some(Event::new(
        &old.namespace,
        &old.name,
        old_state.phase,
        new_state.phase,
        new_state.reason_or_empty(),
    )))
}
