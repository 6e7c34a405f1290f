//! Pre- and post-backup hook commands.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::models::{JobRequest, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreBackup,
    PostBackup,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreBackup => "pre-backup",
            Self::PostBackup => "post-backup",
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum HookError {
    #[error("{stage} hook {script} could not be started: {reason}")]
    Spawn {
        stage: HookStage,
        script: String,
        reason: String,
    },
    #[error("{stage} hook {script} exited with {status}: {stderr}")]
    Failed {
        stage: HookStage,
        script: String,
        status: String,
        stderr: String,
    },
    #[error("{stage} hook {script} timed out after {secs}s")]
    Timeout {
        stage: HookStage,
        script: String,
        secs: u64,
    },
}

/// Run `script` with the job described in its environment. `state` is the
/// job's final state and only set after the backup.
pub async fn run_hook(
    stage: HookStage,
    script: &Path,
    limit: Duration,
    job_id: &str,
    request: &JobRequest,
    state: Option<JobState>,
) -> Result<(), HookError> {
    let name = script.display().to_string();
    let mut command = Command::new(script);
    command
        .env("VMBACKD_HOOK", stage.to_string())
        .env("VMBACKD_JOB_ID", job_id)
        .env("VMBACKD_VMS", request.vms.join(","))
        .env("VMBACKD_MODE", request.mode.as_str())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(state) = state {
        command.env("VMBACKD_JOB_STATE", state.as_str());
    }

    info!(%stage, script = %name, "Running hook");
    let output = match timeout(limit, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(HookError::Spawn {
                stage,
                script: name,
                reason: e.to_string(),
            });
        }
        Err(_) => {
            return Err(HookError::Timeout {
                stage,
                script: name,
                secs: limit.as_secs(),
            });
        }
    };

    if !output.status.success() {
        return Err(HookError::Failed {
            stage,
            script: name,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    debug!(%stage, stdout = %String::from_utf8_lossy(&output.stdout).trim(), "Hook finished");
    Ok(())
}
