//! Running-job registry: one run per job at a time, cancellable by id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<DashMap<String, CancellationToken>>,
}

/// Held for the duration of a run; unregisters the job on drop
pub struct RunGuard {
    jobs: Arc<DashMap<String, CancellationToken>>,
    job_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.job_id);
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job_id` as running. `None` when it already is.
    pub fn try_register(&self, job_id: &str, cancel: CancellationToken) -> Option<RunGuard> {
        match self.jobs.entry(job_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(cancel);
                Some(RunGuard {
                    jobs: Arc::clone(&self.jobs),
                    job_id: job_id.to_string(),
                })
            }
        }
    }

    /// Cancel a running job by its ID
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.jobs.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_registration_refused_until_guard_dropped() {
        let tracker = JobTracker::new();
        let guard = tracker.try_register("job-1", CancellationToken::new());
        assert!(guard.is_some());
        assert!(tracker.try_register("job-1", CancellationToken::new()).is_none());
        assert!(tracker.try_register("job-2", CancellationToken::new()).is_some());
        assert_eq!(tracker.running(), vec!["job-1"]);

        drop(guard);
        assert!(!tracker.is_running("job-1"));
        assert!(tracker.try_register("job-1", CancellationToken::new()).is_some());
    }

    #[test]
    fn test_cancel_reaches_run_token() {
        let tracker = JobTracker::new();
        let token = CancellationToken::new();
        let _guard = tracker.try_register("job-1", token.clone());
        assert!(tracker.cancel("job-1"));
        assert!(token.is_cancelled());
        assert!(!tracker.cancel("job-2"));
    }
}
