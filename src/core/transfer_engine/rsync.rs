use crate::config::RemoteConfig;
use crate::core::layout::{DestinationPlan, finalize_script, preparation_script, shell_quote};
use crate::core::transfer_engine::{
    TransferEngine, TransferError, TransferFuture, TransferRequest, TransferResult,
};
use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Pushes data with rsync over ssh.
pub struct RsyncEngine {
    remote: RemoteConfig,
}

impl RsyncEngine {
    pub fn new(remote: RemoteConfig) -> Self {
        Self { remote }
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.remote.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(key) = &self.remote.ssh_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn host(&self) -> String {
        format!("{}@{}", self.remote.user, self.remote.host)
    }

    /// Run `script` on the backup host through ssh, feeding `stdin` to it.
    fn remote_shell(
        &self,
        script: String,
        stdin: Option<Vec<u8>>,
        on_failure: impl FnOnce(String) -> TransferError + Send + 'static,
    ) -> TransferFuture<()> {
        let ssh_args = self.ssh_args();
        let host = self.host();

        Box::pin(async move {
            let mut child = Command::new("ssh")
                .args(&ssh_args)
                .arg(&host)
                .arg(&script)
                .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| TransferError::Spawn {
                    program: "ssh".to_string(),
                    reason: e.to_string(),
                })?;

            if let (Some(contents), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(&contents).await.map_err(|e| TransferError::Spawn {
                    program: "ssh".to_string(),
                    reason: format!("could not write to ssh: {}", e),
                })?;
                // Closing stdin ends the remote `cat`.
                drop(pipe);
            }

            let output = child.wait_with_output().await.map_err(|e| TransferError::Spawn {
                program: "ssh".to_string(),
                reason: e.to_string(),
            })?;

            if !output.status.success() {
                return Err(on_failure(format!(
                    "ssh exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Ok(())
        })
    }
}

impl TransferEngine for RsyncEngine {
    fn prepare(&self, plan: &DestinationPlan) -> TransferFuture<()> {
        let target = plan.staging_dir.clone();
        debug!(target = %target, "Preparing remote staging directory");
        self.remote_shell(preparation_script(plan), None, move |reason| {
            TransferError::Prepare { target, reason }
        })
    }

    fn finalize(&self, plan: &DestinationPlan) -> TransferFuture<()> {
        let target = plan.target_dir.clone();
        debug!(target = %target, "Publishing remote generation");
        self.remote_shell(finalize_script(plan), None, move |reason| {
            TransferError::Finalize { target, reason }
        })
    }

    fn upload(&self, remote_dir: &str, name: &str, contents: Vec<u8>) -> TransferFuture<TransferResult> {
        let path = format!("{}/{}", remote_dir, name);
        let script = format!("cat > {}", shell_quote(&path));
        let size = contents.len() as u64;
        let failed_path = path.clone();
        let write = self.remote_shell(script, Some(contents), move |reason| TransferError::Failed {
            path: failed_path,
            reason,
        });

        Box::pin(async move {
            let start_time = Instant::now();
            write.await?;
            info!(destination = %path, bytes = size, "(Rsync) Uploaded");
            Ok(TransferResult {
                remote_path: path,
                transferred_bytes: size,
                duration_secs: start_time.elapsed().as_secs(),
            })
        })
    }

    fn transfer(&self, req: &TransferRequest) -> TransferFuture<TransferResult> {
        let req = req.clone();
        let ssh = format!("ssh {}", self.ssh_args().join(" "));
        let host = self.host();
        let compression_level = self.remote.compression_level;

        Box::pin(async move {
            let source = req.local_path.to_string_lossy().to_string();
            let destination = format!("{}:{}/", host, req.remote_dir);
            let start_time = Instant::now();

            info!(source = %source, destination = %destination, mode = %req.mode, "(Rsync) Transferring");

            let mut command = Command::new("rsync");
            command.arg("-a").arg("--partial").arg("--stats").arg("-e").arg(&ssh);
            if compression_level > 0 {
                command
                    .arg("-z")
                    .arg(format!("--compress-level={}", compression_level));
            }
            if let Some(link_dest) = &req.link_dest {
                command.arg(format!("--link-dest={}", link_dest));
            }

            let output = command
                .arg(&source)
                .arg(&destination)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| TransferError::Spawn {
                    program: "rsync".to_string(),
                    reason: e.to_string(),
                })?;

            if !output.status.success() {
                return Err(TransferError::Failed {
                    path: source,
                    reason: format!(
                        "rsync exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let transferred_bytes = parse_transferred_bytes(&stdout).unwrap_or(0);

            Ok(TransferResult {
                remote_path: req.remote_path(),
                transferred_bytes,
                duration_secs: start_time.elapsed().as_secs(),
            })
        })
    }
}

/// Extract "Total transferred file size" from rsync `--stats` output.
pub fn parse_transferred_bytes(stats: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?m)^Total transferred file size:\s*([\d,.]+)\s*bytes")
            .expect("static regex is valid")
    });

    let captures = re.captures(stats)?;
    captures
        .get(1)?
        .as_str()
        .replace([',', '.'], "")
        .parse()
        .ok()
}
