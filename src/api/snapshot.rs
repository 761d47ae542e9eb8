// Snapshot of the experiment store
//
// The event loop hands one of these to every syncer per refresh. Snapshots are
// immutable values; syncers compare the previous and current snapshot to
// decide whether there is work to do.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::{Experiment, ExperimentState, ResourceRef};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiSnapshot {
    pub experiments: Vec<Experiment>,
}

impl ApiSnapshot {
    pub fn new(experiments: Vec<Experiment>) -> Self {
        Self { experiments }
    }

    /// Experiments currently in `state`, in snapshot order
    pub fn experiments_with_state(&self, state: ExperimentState) -> Vec<&Experiment> {
        self.experiments
            .iter()
            .filter(|e| e.result.state == state)
            .collect()
    }

    pub fn find(&self, target: &ResourceRef) -> Option<&Experiment> {
        self.experiments
            .iter()
            .find(|e| e.metadata.namespace == target.namespace && e.metadata.name == target.name)
    }

    /// Content hash, ignoring resource versions. Used to label sync logs.
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for exp in &self.experiments {
            exp.metadata.namespace.hash(&mut hasher);
            exp.metadata.name.hash(&mut hasher);
            // serde_json output is stable for our types; an error only drops the field
            if let Ok(spec) = serde_json::to_vec(&exp.spec) {
                spec.hash(&mut hasher);
            }
            if let Ok(result) = serde_json::to_vec(&exp.result) {
                result.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}
