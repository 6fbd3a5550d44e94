//! Local pod cache turning list/watch deltas into update pairs.
//!
//! Watch streams report the new version of an object only. The controller
//! needs the previous version too, so the cache remembers the last snapshot
//! per pod and pairs it with the next one.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use tracing::{debug, trace};

use crate::types::PodSnapshot;

/// Raw delta from a list/watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawWatchEvent {
    /// A (re)list is starting.
    Init,
    /// An object returned by the (re)list.
    InitApply(PodSnapshot),
    /// The (re)list is complete.
    InitDone,
    /// An object was added or modified.
    Apply(PodSnapshot),
    /// An object was deleted.
    Delete(PodSnapshot),
}

/// Notification consumed by the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotification {
    /// A known pod changed.
    Updated { old: PodSnapshot, new: PodSnapshot },
    /// The initial list has been fully processed. Sent once.
    Synced,
}

/// Last known snapshot of every watched pod.
#[derive(Debug, Default)]
pub struct PodCache {
    pods: HashMap<String, PodSnapshot>,
    relist_seen: Option<HashSet<String>>,
    synced: bool,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Whether the initial list has completed.
    pub fn has_synced(&self) -> bool {
        self.synced
    }

    pub fn get(&self, key: &str) -> Option<&PodSnapshot> {
        self.pods.get(key)
    }

    /// Apply one delta and return the notifications it produces.
    pub fn ingest(&mut self, event: RawWatchEvent) -> Vec<WatchNotification> {
        match event {
            RawWatchEvent::Init => {
                trace!(cached = self.pods.len(), "Relist started");
                self.relist_seen = Some(HashSet::new());
                Vec::new()
            }
            RawWatchEvent::InitApply(pod) => {
                if let Some(seen) = self.relist_seen.as_mut() {
                    seen.insert(pod.key());
                }
                self.store(pod).into_iter().collect()
            }
            RawWatchEvent::InitDone => {
                if let Some(seen) = self.relist_seen.take() {
                    let stale = self
                        .pods
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect_vec();
                    for key in &stale {
                        self.pods.remove(key);
                    }
                    debug!(
                        cached = self.pods.len(),
                        evicted = stale.len(),
                        "Relist complete"
                    );
                }
                if self.synced {
                    Vec::new()
                } else {
                    self.synced = true;
                    vec![WatchNotification::Synced]
                }
            }
            RawWatchEvent::Apply(pod) => self.store(pod).into_iter().collect(),
            RawWatchEvent::Delete(pod) => {
                self.pods.remove(&pod.key());
                Vec::new()
            }
        }
    }

    fn store(&mut self, new: PodSnapshot) -> Option<WatchNotification> {
        let old = self.pods.insert(new.key(), new.clone())?;
        Some(WatchNotification::Updated { old, new })
    }
}
