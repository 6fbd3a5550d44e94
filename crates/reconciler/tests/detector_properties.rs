//! Property-based tests for transition detection using proptest.
//!
//! Properties verified:
//! - Detection is deterministic
//! - An event is produced iff Running -> Terminated with reason "Completed"
//! - Produced events carry the pod identity and observed phases

use essential_reconciler::{ContainerPhase, ContainerState, PodSnapshot, detect};
use proptest::prelude::*;
use proptest::sample::select;

const REASONS: [&str; 6] = ["Completed", "Error", "OOMKilled", "ContainerCreating", "completed", ""];

fn phase() -> impl Strategy<Value = ContainerPhase> {
    select(ContainerPhase::ALL.to_vec())
}

fn state() -> impl Strategy<Value = Option<ContainerState>> {
    (phase(), select(REASONS.to_vec()), any::<bool>()).prop_map(|(phase, reason, reported)| {
        reported.then(|| ContainerState {
            phase,
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        })
    })
}

fn snapshot(state: Option<ContainerState>) -> PodSnapshot {
    let pod = PodSnapshot::new("default", "web-1")
        .with_label("essential-container", "logger")
        .with_container("logger");
    match state {
        Some(state) => pod.with_status("logger", state),
        None => pod,
    }
}

proptest! {
    #[test]
    fn prop_detection_is_deterministic(old in state(), new in state()) {
        let old = snapshot(old);
        let new = snapshot(new);

        prop_assert_eq!(detect(&old, &new, "logger"), detect(&old, &new, "logger"));
    }

    #[test]
    fn prop_event_iff_successful_completion(old in state(), new in state()) {
        let expected = matches!(
            (&old, &new),
            (
                Some(ContainerState { phase: ContainerPhase::Running, .. }),
                Some(ContainerState { phase: ContainerPhase::Terminated, reason: Some(reason) }),
            ) if reason == "Completed"
        );

        let detected = detect(&snapshot(old), &snapshot(new), "logger");

        prop_assert!(detected.is_ok());
        prop_assert_eq!(detected.ok().flatten().is_some(), expected);
    }

    #[test]
    fn prop_event_carries_identity(reason in select(REASONS.to_vec())) {
        let old = snapshot(Some(ContainerState::running()));
        let new = snapshot(Some(ContainerState::terminated(reason)));

        if let Ok(Some(event)) = detect(&old, &new, "logger") {
            prop_assert_eq!(event.pod_name.as_str(), "web-1");
            prop_assert_eq!(event.namespace.as_str(), "default");
            prop_assert_eq!(event.old_phase, ContainerPhase::Running);
            prop_assert_eq!(event.new_phase, ContainerPhase::Terminated);
            prop_assert_eq!(event.reason.as_str(), "Completed");
        }
    }

    #[test]
    fn prop_undeclared_container_is_always_an_error(old in state(), new in state()) {
        let detected = detect(&snapshot(old), &snapshot(new), "sidecar");

        prop_assert!(detected.is_err());
    }
}
