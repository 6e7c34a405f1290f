pub mod cadence;
pub mod error;
pub mod hooks;
pub mod hypervisor;
pub mod layout;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod transfer_engine;

pub use cadence::{ScheduleZone, next_due};
pub use error::{CadenceError, ConfigurationError, Error, StoreError};
pub use hypervisor::{Hypervisor, SnapshotManager, VmInfo, VmLister};
pub use models::{
    BackupMode, Cadence, JobRequest, JobResult, JobState, JobStatus, NewSchedule, RunOutcome,
    ScheduleDefinition, ScheduleUpdate, TimeOfDay, VmOutcome,
};
pub use orchestrator::Orchestrator;
pub use registry::JobRegistry;
pub use runner::JobRunner;
pub use scheduler::BackupScheduler;
