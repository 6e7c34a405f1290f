use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::cadence::ScheduleZone;
use crate::core::transfer_engine::TransferEngineType;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmbackd/config.toml";
const ENV_PREFIX: &str = "VMBACKD_";

/// Backup host reached over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub ssh_key: Option<PathBuf>,
    pub backup_dir: String,
    /// rsync compression level, 0 disables compression
    pub compression_level: u8,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: "backup".to_string(),
            port: 22,
            ssh_key: None,
            backup_dir: "/srv/vm-backups".to_string(),
            compression_level: 6,
        }
    }
}

/// Commands run on the hypervisor host around every non-dry-run job. A
/// failing hook is reported as a job warning and never fails the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub pre_backup: Option<PathBuf>,
    pub post_backup: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            pre_backup: None,
            post_backup: None,
            timeout_secs: 300,
        }
    }
}

impl HookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub schedules_file: PathBuf,
    pub database_file: PathBuf,
    pub poll_interval_secs: u64,
    pub rpc_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub timezone: ScheduleZone,
    pub transfer_engine: TransferEngineType,
    pub libvirt_uri: String,
    /// Finished jobs kept in memory for status queries
    pub job_retention: usize,
    pub job_retention_hours: u64,
    /// VMs backed up concurrently within one job
    pub parallel_vms: usize,
    pub use_snapshots: bool,
    /// A failed snapshot fails the VM instead of falling back to a live copy
    pub require_snapshots: bool,
    pub snapshot_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub keep_archives: usize,
    pub remote: RemoteConfig,
    pub hooks: HookConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schedules_file: PathBuf::from("/var/lib/vmbackd/schedules.json"),
            database_file: PathBuf::from("/var/lib/vmbackd/history.db"),
            poll_interval_secs: 60,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            simulation: false,
            verbose: false,
            json_logs: false,
            timezone: ScheduleZone::Local,
            transfer_engine: TransferEngineType::Rsync,
            libvirt_uri: "qemu:///system".to_string(),
            job_retention: 200,
            job_retention_hours: 24 * 7,
            parallel_vms: 2,
            use_snapshots: true,
            require_snapshots: true,
            snapshot_timeout_secs: 300,
            transfer_timeout_secs: 6 * 60 * 60,
            keep_archives: 30,
            remote: RemoteConfig::default(),
            hooks: HookConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `VMBACKD_*` environment variables and
    /// command line overrides, in that order.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let path = std::env::var(format!("{}CONFIG", ENV_PREFIX))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG"]).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", path.display()))?;
        config.validate()?;

        // Simulation mode never touches a real backup host.
        let mut config = config;
        if config.simulation {
            config.transfer_engine = TransferEngineType::Simulated;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be at least 1");
        }
        if self.parallel_vms == 0 {
            bail!("parallel_vms must be at least 1");
        }
        if self.remote.compression_level > 9 {
            bail!(
                "remote.compression_level must be between 0 and 9, got {}",
                self.remote.compression_level
            );
        }
        if self.job_retention == 0 {
            bail!("job_retention must be at least 1");
        }
        if self.hooks.timeout_secs == 0 {
            bail!("hooks.timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Render the configuration in the same TOML layout the loader reads.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}
