//! Background loop that fires due schedules.
//!
//! Each poll takes the store's writer lock, advances `next_run` of every due
//! schedule to the next occurrence strictly after "now", persists, and only
//! then dispatches jobs. A late poll therefore fires each due instant at most
//! once. Completion records `last_run`/`last_outcome` but never touches
//! `next_run`: a failed run waits for the next cycle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::db;
use crate::logging::LogThrottle;

use super::cadence::ScheduleZone;
use super::error::StoreError;
use super::models::{JobRequest, JobResult, JobState, RunOutcome};
use super::runner::JobRunner;

/// A job the scheduler decided to start during one poll.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub schedule_id: String,
    pub job_id: String,
    pub fired_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BackupScheduler {
    ctx: AppContext,
    runner: JobRunner,
    zone: ScheduleZone,
    /// Schedules whose last dispatched job has not finished yet.
    in_flight: Arc<Mutex<HashSet<String>>>,
    store_errors: Arc<LogThrottle>,
}

impl BackupScheduler {
    pub fn new(ctx: AppContext) -> Self {
        let runner = ctx.runner();
        let zone = ctx.config.timezone;
        Self {
            ctx,
            runner,
            zone,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            store_errors: Arc::new(LogThrottle::new(Duration::from_secs(300))),
        }
    }

    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// Poll every `poll_interval` until `shutdown` is cancelled. Cancellation
    /// is observed between polls; jobs already dispatched keep running.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.ctx.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.ctx.config.poll_interval_secs,
            zone = ?self.zone,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once(Utc::now()).await {
                Ok(dispatched) => {
                    if self.store_errors.reset() {
                        info!("Schedule store readable again");
                    }
                    if !dispatched.is_empty() {
                        debug!(count = dispatched.len(), "Poll dispatched jobs");
                    }
                }
                Err(e) => {
                    if let Some(suppressed) = self.store_errors.should_log() {
                        error!(
                            error = %e,
                            suppressed,
                            "Schedule store unavailable, retrying next poll"
                        );
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Evaluate all schedules at `now` and dispatch the due ones.
    ///
    /// Nothing is dispatched unless the advanced `next_run` values were
    /// persisted first.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Vec<Dispatched>, StoreError> {
        let busy = self.in_flight_snapshot();
        let mut due = Vec::new();

        {
            let mut txn = self.ctx.schedules.lock().await?;
            let mut changed = false;

            for def in txn.schedules_mut().values_mut() {
                if !def.is_due(now) {
                    continue;
                }

                let next = match self.zone.next_due(&def.cadence, now) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(schedule_id = %def.id, error = %e, "Cannot compute next run, skipping");
                        continue;
                    }
                };
                debug_assert!(next > now, "next run {} not after {}", next, now);
                if next <= now {
                    error!(
                        schedule_id = %def.id,
                        next = %next,
                        now = %now,
                        "Computed next run is not after now, skipping dispatch"
                    );
                    continue;
                }

                def.next_run = Some(next);
                changed = true;

                if busy.contains(&def.id) {
                    warn!(
                        schedule_id = %def.id,
                        next_run = %next,
                        "Previous run still in progress, skipping this cycle"
                    );
                    continue;
                }

                info!(schedule_id = %def.id, name = %def.name, next_run = %next, "Schedule due");
                let request = JobRequest {
                    vms: def.vms.clone(),
                    mode: def.mode,
                    dry_run: false,
                    use_snapshots: self.ctx.config.use_snapshots,
                };
                due.push((def.id.clone(), request));
            }

            if changed {
                txn.commit().await?;
            }
        }

        let mut dispatched = Vec::with_capacity(due.len());
        for (schedule_id, request) in due {
            let job_id = Uuid::now_v7().to_string();
            self.ctx
                .registry
                .create(job_id.clone(), Some(schedule_id.clone()), &request)
                .await;
            self.lock_in_flight().insert(schedule_id.clone());

            let scheduler = self.clone();
            let job = Dispatched {
                schedule_id,
                job_id,
                fired_at: now,
            };
            dispatched.push(job.clone());

            self.ctx.tasks.spawn(async move {
                let result = execute(
                    &scheduler.ctx,
                    &scheduler.runner,
                    &job.job_id,
                    Some(&job.schedule_id),
                    &request,
                )
                .await;
                scheduler.complete(&job, &result).await;
                scheduler.lock_in_flight().remove(&job.schedule_id);
            });
        }

        Ok(dispatched)
    }

    /// Ids of schedules that would fire if polled at `now`.
    pub async fn due_now(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let busy = self.in_flight_snapshot();
        let schedules = self.ctx.schedules.load().await?;
        Ok(schedules
            .values()
            .filter(|def| def.is_due(now) && !busy.contains(&def.id))
            .map(|def| def.id.clone())
            .collect())
    }

    /// Fill in missing `next_run` values of enabled schedules and clear stale
    /// ones on disabled schedules. Returns how many schedules changed.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut txn = self.ctx.schedules.lock().await?;
        let mut repaired = 0;

        for def in txn.schedules_mut().values_mut() {
            if def.enabled && def.next_run.is_none() {
                match self.zone.next_due(&def.cadence, now) {
                    Ok(next) => {
                        info!(schedule_id = %def.id, next_run = %next, "Restored missing next run");
                        def.next_run = Some(next);
                        repaired += 1;
                    }
                    Err(e) => {
                        error!(schedule_id = %def.id, error = %e, "Cannot compute next run");
                    }
                }
            } else if !def.enabled && def.next_run.is_some() {
                def.next_run = None;
                repaired += 1;
            }
        }

        if repaired > 0 {
            txn.commit().await?;
        }
        Ok(repaired)
    }

    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    async fn complete(&self, job: &Dispatched, result: &JobResult) {
        if let Err(e) = self.record_outcome(job, result).await {
            error!(
                schedule_id = %job.schedule_id,
                job_id = %job.job_id,
                error = %e,
                "Failed to record run outcome"
            );
        }
    }

    async fn record_outcome(&self, job: &Dispatched, result: &JobResult) -> Result<(), StoreError> {
        let mut txn = self.ctx.schedules.lock().await?;
        let Some(def) = txn.get_mut(&job.schedule_id) else {
            debug!(schedule_id = %job.schedule_id, "Schedule removed while its job was running");
            return Ok(());
        };

        def.last_run = Some(job.fired_at);
        def.last_outcome = match result.state {
            JobState::Succeeded => RunOutcome::Success,
            _ => RunOutcome::Failure,
        };
        def.last_error = result.error.clone();
        def.last_job_id = Some(job.job_id.clone());
        txn.commit().await
    }

    fn in_flight_snapshot(&self) -> HashSet<String> {
        self.lock_in_flight().clone()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run a registered job to completion, keeping the registry and the history
/// database up to date.
pub async fn execute(
    ctx: &AppContext,
    runner: &JobRunner,
    job_id: &str,
    schedule_id: Option<&str>,
    request: &JobRequest,
) -> JobResult {
    let span = info_span!("backup_job", job_id = %job_id, schedule_id = ?schedule_id);

    async {
        ctx.registry.mark_running(job_id).await;
        info!(
            vms = ?request.vms,
            mode = %request.mode,
            dry_run = request.dry_run,
            "Job started"
        );

        let result = runner.run(job_id, request).await;
        match result.state {
            JobState::Succeeded => info!(bytes = result.transferred_bytes(), "Job succeeded"),
            _ => warn!(error = ?result.error, "Job failed"),
        }

        if let Some(status) = ctx.registry.finish(job_id, result.clone()).await {
            if let Err(e) = db::jobs::record(&ctx.db, &status).await {
                warn!(error = %e, "Failed to write job history");
            }
        }

        result
    }
    .instrument(span)
    .await
}
