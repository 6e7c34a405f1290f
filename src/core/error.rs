use std::path::PathBuf;

use thiserror::Error;

/// Rejected schedule or job definition. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("schedule name must not be empty")]
    EmptyName,
    #[error("at least one VM must be selected")]
    EmptyVmSet,
    #[error("VM names must not be blank")]
    BlankVmName,
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),
    #[error("invalid weekday '{0}'")]
    InvalidWeekday(String),
    #[error("day of month must be between 1 and 31, got {0}")]
    InvalidDayOfMonth(i64),
    #[error("unknown cadence kind '{0}', expected daily, weekly or monthly")]
    UnknownCadence(String),
    #[error("malformed {kind} cadence '{value}'")]
    MalformedCadence { kind: &'static str, value: String },
    #[error("unknown backup mode '{0}'")]
    UnknownMode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CadenceError {
    #[error("invalid cadence: {0}")]
    InvalidCadence(String),
}

/// Failure reading or writing the persisted schedule document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schedule store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schedule document {path} is malformed: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode schedule document: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unsupported schedule document version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("schedule entry '{id}' is invalid: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Errors surfaced by the core to its presentation layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigurationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cadence(#[from] CadenceError),
    #[error(transparent)]
    VmList(#[from] crate::core::hypervisor::VmListError),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("scheduling invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
