use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::types::JobDefinition;

/// Per-cycle outcome of a job as seen by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unknown,
    Completed,
    Failed,
}

/// Whether a job's prerequisites allow it to run right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Some dependencies have not completed (yet) in this cycle.
    Waiting(Vec<String>),
    /// At least one dependency failed this cycle; the job is skipped.
    Blocked(Vec<String>),
}

/// Transient tracker of which jobs completed or failed in the current cycle.
///
/// Nothing here is persisted. The controller resets the gate at the start of
/// every cycle, so a dependency must succeed in the same cycle as its
/// dependents to unblock them.
#[derive(Debug, Default)]
pub struct DependencyGate {
    outcomes: RwLock<HashMap<String, bool>>,
}

impl DependencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(&self, job_id: &str) -> Outcome {
        match self
            .outcomes
            .read()
            .expect("dependency gate poisoned")
            .get(job_id)
        {
            Some(true) => Outcome::Completed,
            Some(false) => Outcome::Failed,
            None => Outcome::Unknown,
        }
    }

    /// Classify `job` against the outcomes recorded so far.
    pub fn readiness(&self, job: &JobDefinition) -> Readiness {
        if job.dependencies.is_empty() {
            return Readiness::Ready;
        }
        let outcomes = self.outcomes.read().expect("dependency gate poisoned");

        let failed: Vec<String> = job
            .dependencies
            .iter()
            .filter(|dep| outcomes.get(*dep) == Some(&false))
            .cloned()
            .collect();
        if !failed.is_empty() {
            return Readiness::Blocked(failed);
        }

        let pending: Vec<String> = job
            .dependencies
            .iter()
            .filter(|dep| outcomes.get(*dep) != Some(&true))
            .cloned()
            .collect();
        if pending.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Waiting(pending)
        }
    }

    /// True iff every dependency completed successfully in this cycle.
    ///
    /// A failed dependency blocks the job for the rest of the cycle.
    pub fn can_run(&self, job: &JobDefinition) -> bool {
        match self.readiness(job) {
            Readiness::Ready => true,
            Readiness::Waiting(pending) => {
                debug!(job_id = %job.id, ?pending, "dependencies not yet completed");
                false
            }
            Readiness::Blocked(failed) => {
                warn!(job_id = %job.id, ?failed, "dependency failed this cycle; job skipped");
                false
            }
        }
    }

    /// Record a job outcome. Last write wins.
    pub fn mark(&self, job_id: &str, success: bool) {
        self.outcomes
            .write()
            .expect("dependency gate poisoned")
            .insert(job_id.to_string(), success);
    }

    /// Forget every outcome; called at the start of each cycle.
    pub fn reset(&self) {
        self.outcomes
            .write()
            .expect("dependency gate poisoned")
            .clear();
    }
}
