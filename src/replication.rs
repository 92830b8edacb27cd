use log::debug;

use crate::clock::Timestamp;
use crate::store::{Fragment, StateStore};

/// Fans updates of one source bay out to a fixed set of target bays.
///
/// Only the incoming fragment is copied, never the source's full state, so
/// fields a target already diverged on stay as they are.
#[derive(Debug, Clone, Default)]
pub struct ReplicationRule {
    source: Option<String>,
    targets: Vec<String>,
}

impl ReplicationRule {
    pub fn new(source: Option<String>, targets: Vec<String>) -> Self {
        ReplicationRule { source, targets }
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Merges `fragment` into `id` and, when `id` is the source, into every
    /// target with the same timestamp. Returns the ids written, source first.
    pub fn apply(
        &self,
        store: &mut StateStore,
        id: &str,
        fragment: &Fragment,
        now: Timestamp,
    ) -> Vec<String> {
        if store.merge(id, fragment, now).created {
            debug!("Tracking new bay {}", id);
        }
        let mut written = vec![id.to_string()];

        if self.source.as_deref() != Some(id) {
            return written;
        }
        for target in self.targets.iter().filter(|target| target.as_str() != id) {
            if store.merge(target, fragment, now).created {
                debug!("Tracking new bay {} through replication", target);
            }
            written.push(target.clone());
        }
        written
    }
}
