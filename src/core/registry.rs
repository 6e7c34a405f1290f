//! In-memory table of recently dispatched jobs.
//!
//! Status queries are answered from here without touching the history
//! database. Finished jobs are evicted once there are more than the count
//! bound or they are older than the age bound; queued and running jobs are
//! never evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::RwLock;

use super::models::{JobRequest, JobResult, JobState, JobStatus};

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, JobStatus>,
    /// Job ids in dispatch order, oldest first.
    order: VecDeque<String>,
}

#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    max_finished: usize,
    max_age: TimeDelta,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(200, TimeDelta::days(7))
    }
}

impl JobRegistry {
    pub fn new(max_finished: usize, max_age: TimeDelta) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            max_finished,
            max_age,
        }
    }

    /// Register a new queued job and return its status.
    pub async fn create(
        &self,
        id: String,
        schedule_id: Option<String>,
        request: &JobRequest,
    ) -> JobStatus {
        let status = JobStatus::queued(id.clone(), schedule_id, request);
        let mut inner = self.inner.write().await;
        inner.order.push_back(id.clone());
        inner.jobs.insert(id, status.clone());
        status
    }

    pub async fn mark_running(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        }
    }

    /// Record the job's result and return the final status.
    pub async fn finish(&self, id: &str, result: JobResult) -> Option<JobStatus> {
        let mut inner = self.inner.write().await;
        let finished = inner.jobs.get_mut(id).map(|job| {
            let now = Utc::now();
            job.started_at.get_or_insert(now);
            job.finished_at = Some(now);
            job.state = result.state;
            job.error = result.error;
            job.results = result.outcomes;
            job.warnings = result.warnings;
            job.clone()
        });

        self.evict(&mut inner);
        finished
    }

    pub async fn get(&self, id: &str) -> Option<JobStatus> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    /// All retained jobs, newest first.
    pub async fn list(&self) -> Vec<JobStatus> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .jobs
            .values()
            .filter(|job| !job.state.is_finished())
            .count()
    }

    fn evict(&self, inner: &mut RegistryInner) {
        let cutoff = Utc::now().checked_sub_signed(self.max_age);
        let mut finished = inner
            .jobs
            .values()
            .filter(|job| job.state.is_finished())
            .count();

        let RegistryInner { jobs, order } = inner;
        order.retain(|id| {
            let Some(job) = jobs.get(id) else {
                return false;
            };
            if !job.state.is_finished() {
                return true;
            }
            let expired = job
                .finished_at
                .zip(cutoff)
                .is_some_and(|(at, cutoff)| at < cutoff);
            if finished > self.max_finished || expired {
                finished -= 1;
                jobs.remove(id);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::BackupMode;

    fn request() -> JobRequest {
        JobRequest {
            vms: vec!["web01".to_string()],
            mode: BackupMode::Full,
            dry_run: false,
            use_snapshots: true,
        }
    }

    fn succeeded() -> JobResult {
        JobResult {
            state: JobState::Succeeded,
            error: None,
            outcomes: vec![],
            warnings: vec![],
        }
    }

    #[tokio::test]
    async fn tracks_job_lifecycle() {
        let registry = JobRegistry::default();

        let job = registry.create("job-1".to_string(), None, &request()).await;
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(registry.active_count().await, 1);

        registry.mark_running("job-1").await;
        let running = registry.get("job-1").await.unwrap();
        assert_eq!(running.state, JobState::Running);
        assert!(running.started_at.is_some());

        let done = registry.finish("job-1", succeeded()).await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(done.finished_at.is_some());
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let registry = JobRegistry::default();
        for id in ["a", "b", "c"] {
            registry.create(id.to_string(), None, &request()).await;
        }

        let ids: Vec<String> = registry.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn evicts_oldest_finished_beyond_count() {
        let registry = JobRegistry::new(2, TimeDelta::days(1));
        registry.create("running".to_string(), None, &request()).await;
        for id in ["a", "b", "c"] {
            registry.create(id.to_string(), None, &request()).await;
            registry.finish(id, succeeded()).await;
        }

        assert!(registry.get("a").await.is_none());
        assert!(registry.get("b").await.is_some());
        assert!(registry.get("c").await.is_some());
        assert!(registry.get("running").await.is_some());
    }

    #[tokio::test]
    async fn evicts_expired_finished_jobs() {
        let registry = JobRegistry::new(10, TimeDelta::seconds(-1));
        registry.create("old".to_string(), None, &request()).await;
        registry.finish("old", succeeded()).await;

        assert!(registry.get("old").await.is_none());
    }
}
