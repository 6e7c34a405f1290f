use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::job_tag;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub running: bool,
    pub disk_paths: Vec<PathBuf>,
    /// Hypervisor definition file, copied alongside the disks when present.
    pub definition_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub vm: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
pub enum VmListError {
    #[error("failed to list VMs: {0}")]
    Failed(String),
    #[error("listing VMs timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    #[error("snapshot '{snapshot}' of {vm} failed: {reason}")]
    Failed {
        vm: String,
        snapshot: String,
        reason: String,
    },
    #[error("snapshot '{snapshot}' of {vm} timed out after {secs}s")]
    Timeout {
        vm: String,
        snapshot: String,
        secs: u64,
    },
}

/// Enumerates the VMs known to the hypervisor.
#[async_trait]
pub trait VmLister: Send + Sync {
    async fn list(&self) -> Result<Vec<VmInfo>, VmListError>;
}

/// Creates and deletes point-in-time VM snapshots.
#[async_trait]
pub trait SnapshotManager: Send + Sync {
    async fn create(&self, vm: &str, name: &str) -> Result<SnapshotRef, SnapshotError>;

    async fn delete(&self, vm: &str, name: &str) -> Result<(), SnapshotError>;
}

/// Both hypervisor capabilities, as provided by every adapter.
pub trait Hypervisor: VmLister + SnapshotManager {}

impl<T: VmLister + SnapshotManager> Hypervisor for T {}

/// Name of the snapshot job `job_id` takes at `at`. Unique per job, so jobs
/// sharing a VM and a start second never create or delete each other's.
pub fn snapshot_name(at: DateTime<Utc>, job_id: &str) -> String {
    format!("backup-{}-{}", at.format("%Y%m%d-%H%M%S"), job_tag(job_id))
}
