use std::sync::Arc;

use chrono::TimeDelta;
use tokio_rusqlite::Connection;
use tokio_util::task::TaskTracker;

use crate::config::AppConfig;
use crate::core::hypervisor::Hypervisor;
use crate::core::registry::JobRegistry;
use crate::core::runner::{JobRunner, RunnerSettings, VmLocks};
use crate::core::transfer_engine::TransferEngine;
use crate::store::ScheduleStore;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub registry: JobRegistry,
    pub schedules: Arc<ScheduleStore>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub transfer: Arc<dyn TransferEngine>,
    /// Every dispatched job, so shutdown can wait for them.
    pub tasks: TaskTracker,
    /// Shared by every runner so jobs never back up one VM concurrently.
    pub vm_locks: VmLocks,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        db: Connection,
        schedules: ScheduleStore,
        hypervisor: Arc<dyn Hypervisor>,
        transfer: Arc<dyn TransferEngine>,
    ) -> Self {
        let registry = JobRegistry::new(
            config.job_retention,
            i64::try_from(config.job_retention_hours)
                .ok()
                .and_then(TimeDelta::try_hours)
                .unwrap_or(TimeDelta::MAX),
        );

        Self {
            config: Arc::new(config),
            db,
            registry,
            schedules: Arc::new(schedules),
            hypervisor,
            transfer,
            tasks: TaskTracker::new(),
            vm_locks: VmLocks::default(),
        }
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::new(
            self.hypervisor.clone(),
            self.transfer.clone(),
            RunnerSettings::from_config(&self.config),
        )
        .with_vm_locks(self.vm_locks.clone())
    }
}
