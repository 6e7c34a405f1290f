use std::time::Instant;

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::db;
use crate::db::jobs::{BackupStatistics, JobHistoryEntry};
use crate::rpc::RpcServer;

use super::error::{Error, Result};
use super::hypervisor::VmInfo;
use super::models::{
    JobRequest, JobStatus, NewSchedule, RunOutcome, ScheduleDefinition, ScheduleUpdate, dedup_vms,
    validate_name, validate_vms,
};
use super::scheduler::{BackupScheduler, execute};

/// Snapshot of the daemon's health for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub simulation: bool,
    pub schedules: usize,
    pub enabled_schedules: usize,
    pub active_jobs: usize,
    pub next_run: Option<DateTime<Utc>>,
}

/// Entry point for everything the presentation layer can ask of the daemon.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: AppContext,
    scheduler: BackupScheduler,
    started: Instant,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let scheduler = BackupScheduler::new(ctx.clone());
        Self {
            ctx,
            scheduler,
            started: Instant::now(),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn scheduler(&self) -> &BackupScheduler {
        &self.scheduler
    }

    /// Run the daemon until `shutdown` is cancelled, then wait for in-flight
    /// jobs to record their outcome.
    pub async fn start(&self, shutdown: CancellationToken) -> AnyResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            simulation = self.ctx.config.simulation,
            schedules = %self.ctx.schedules.path().display(),
            "Daemon starting"
        );

        let repaired = self
            .scheduler
            .recover(Utc::now())
            .await
            .context("Failed to recover schedule state")?;
        if repaired > 0 {
            info!(count = repaired, "Repaired schedule next-run values");
        }

        let scheduler = self.scheduler.clone();
        let scheduler_shutdown = shutdown.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

        let rpc = RpcServer::new(self.clone(), self.ctx.config.rpc_bind);
        let rpc_result = rpc.serve(shutdown.clone()).await;
        if let Err(e) = &rpc_result {
            error!(error = %e, "RPC server failed, shutting down");
            shutdown.cancel();
        }

        if let Err(e) = scheduler_task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }

        self.ctx.tasks.close();
        let pending = self.ctx.tasks.len();
        if pending > 0 {
            info!(jobs = pending, "Waiting for running jobs to finish");
        }
        self.ctx.tasks.wait().await;
        info!("Daemon stopped");

        rpc_result
    }

    pub async fn add_schedule(&self, new: NewSchedule) -> Result<ScheduleDefinition> {
        let new = NewSchedule {
            vms: dedup_vms(new.vms),
            name: new.name.trim().to_string(),
            ..new
        };
        new.validate()?;

        let now = Utc::now();
        let next_run = if new.enabled {
            Some(self.scheduler.zone().next_due(&new.cadence, now)?)
        } else {
            None
        };

        let def = ScheduleDefinition {
            id: Uuid::now_v7().to_string(),
            name: new.name,
            vms: new.vms,
            cadence: new.cadence,
            mode: new.mode,
            enabled: new.enabled,
            created_at: now,
            last_run: None,
            last_outcome: RunOutcome::None,
            last_error: None,
            last_job_id: None,
            next_run,
        };

        self.ctx.schedules.upsert(def.clone()).await?;
        info!(schedule_id = %def.id, name = %def.name, cadence = %def.cadence, "Schedule added");
        Ok(def)
    }

    pub async fn remove_schedule(&self, id: &str) -> Result<ScheduleDefinition> {
        let removed = self.ctx.schedules.remove(id).await?;
        info!(schedule_id = %id, "Schedule removed");
        Ok(removed)
    }

    pub async fn enable(&self, id: &str) -> Result<ScheduleDefinition> {
        let zone = self.scheduler.zone();
        self.edit(id, |def| {
            // Re-enabling an enabled schedule keeps its pending firing.
            if !def.enabled || def.next_run.is_none() {
                def.enabled = true;
                def.next_run = Some(zone.next_due(&def.cadence, Utc::now())?);
            }
            Ok(())
        })
        .await
    }

    pub async fn disable(&self, id: &str) -> Result<ScheduleDefinition> {
        self.edit(id, |def| {
            def.enabled = false;
            def.next_run = None;
            Ok(())
        })
        .await
    }

    pub async fn update_schedule(
        &self,
        id: &str,
        update: ScheduleUpdate,
    ) -> Result<ScheduleDefinition> {
        let zone = self.scheduler.zone();
        self.edit(id, move |def| {
            if let Some(name) = update.name {
                validate_name(&name)?;
                def.name = name.trim().to_string();
            }
            if let Some(vms) = update.vms {
                let vms = dedup_vms(vms);
                validate_vms(&vms)?;
                def.vms = vms;
            }
            if let Some(mode) = update.mode {
                def.mode = mode;
            }
            if let Some(cadence) = update.cadence {
                cadence.validate()?;
                def.cadence = cadence;
                if def.enabled {
                    def.next_run = Some(zone.next_due(&def.cadence, Utc::now())?);
                }
            }
            Ok(())
        })
        .await
    }

    /// Apply `change` to one schedule inside the store's writer section.
    /// Nothing is persisted if `change` fails.
    async fn edit(
        &self,
        id: &str,
        change: impl FnOnce(&mut ScheduleDefinition) -> Result<()>,
    ) -> Result<ScheduleDefinition> {
        let mut txn = self.ctx.schedules.lock().await?;
        let def = txn
            .get_mut(id)
            .ok_or_else(|| Error::ScheduleNotFound(id.to_string()))?;

        change(def)?;
        def.validate()?;
        let updated = def.clone();

        txn.commit().await?;
        info!(schedule_id = %id, enabled = updated.enabled, next_run = ?updated.next_run, "Schedule updated");
        Ok(updated)
    }

    pub async fn get_schedule(&self, id: &str) -> Result<ScheduleDefinition> {
        self.ctx.schedules.get(id).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        Ok(self.ctx.schedules.load().await?.into_values().collect())
    }

    /// Ids of the schedules that would fire if the loop polled right now.
    pub async fn due_now(&self) -> Result<Vec<String>> {
        Ok(self.scheduler.due_now(Utc::now()).await?)
    }

    /// Dispatch an ad hoc job outside the schedule path and return its id.
    pub async fn run_now(&self, request: JobRequest) -> Result<String> {
        let request = JobRequest {
            vms: dedup_vms(request.vms),
            ..request
        };
        request.validate()?;

        let job_id = Uuid::now_v7().to_string();
        self.ctx
            .registry
            .create(job_id.clone(), None, &request)
            .await;

        let ctx = self.ctx.clone();
        let runner = self.ctx.runner();
        let id = job_id.clone();
        self.ctx.tasks.spawn(
            async move {
                execute(&ctx, &runner, &id, None, &request).await;
            }
            .instrument(info_span!("run_now")),
        );

        Ok(job_id)
    }

    pub async fn get_job(&self, id: &str) -> Result<JobStatus> {
        self.ctx
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    pub async fn list_jobs(&self) -> Vec<JobStatus> {
        self.ctx.registry.list().await
    }

    pub async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        Ok(self.ctx.runner().list_vms().await?)
    }

    pub async fn history(&self, limit: u32, offset: u32) -> AnyResult<Vec<JobHistoryEntry>> {
        db::jobs::list(&self.ctx.db, limit, offset).await
    }

    pub async fn statistics(&self) -> AnyResult<BackupStatistics> {
        db::jobs::stats(&self.ctx.db).await
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        let schedules = self.ctx.schedules.load().await?;
        let next_run = schedules
            .values()
            .filter(|def| def.enabled)
            .filter_map(|def| def.next_run)
            .min();

        Ok(DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            simulation: self.ctx.config.simulation,
            schedules: schedules.len(),
            enabled_schedules: schedules.values().filter(|def| def.enabled).count(),
            active_jobs: self.ctx.registry.active_count().await,
            next_run,
        })
    }
}
