mod rsync;
mod simulated;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RemoteConfig;
use crate::core::layout::DestinationPlan;
use crate::core::models::BackupMode;

pub use rsync::{RsyncEngine, parse_transferred_bytes};
pub use simulated::{SimulatedEngine, Upload};

pub type TransferFuture<T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransferEngineType {
    #[default]
    Rsync,
    Simulated,
}

/// One file or directory to push to the backup host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub job_id: String,
    pub vm: String,
    pub local_path: PathBuf,
    /// Remote directory the path is copied into.
    pub remote_dir: String,
    pub mode: BackupMode,
    pub link_dest: Option<String>,
}

impl TransferRequest {
    pub fn remote_path(&self) -> String {
        let name = self
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{}/{}", self.remote_dir, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub remote_path: String,
    pub transferred_bytes: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("failed to prepare {target}: {reason}")]
    Prepare { target: String, reason: String },
    #[error("failed to publish {target}: {reason}")]
    Finalize { target: String, reason: String },
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("transfer of {path} failed: {reason}")]
    Failed { path: String, reason: String },
    #[error("transfer of {path} timed out after {secs}s")]
    Timeout { path: String, secs: u64 },
}

/// Moves VM data to the backup host.
pub trait TransferEngine: Send + Sync {
    /// Create an empty staging directory for `plan`.
    fn prepare(&self, plan: &DestinationPlan) -> TransferFuture<()>;

    fn transfer(&self, req: &TransferRequest) -> TransferFuture<TransferResult>;

    /// Write `contents` as `remote_dir/name` on the backup host.
    fn upload(&self, remote_dir: &str, name: &str, contents: Vec<u8>) -> TransferFuture<TransferResult>;

    /// Rotate generations and publish the staging directory of `plan`.
    fn finalize(&self, plan: &DestinationPlan) -> TransferFuture<()>;
}

pub fn create_engine(engine_type: TransferEngineType, remote: &RemoteConfig) -> Arc<dyn TransferEngine> {
    match engine_type {
        TransferEngineType::Rsync => Arc::new(RsyncEngine::new(remote.clone())),
        TransferEngineType::Simulated => Arc::new(SimulatedEngine::default()),
    }
}
