//! Executes one backup job.
//!
//! The runner has no knowledge of schedules: it takes a [`JobRequest`], backs
//! up each VM independently and reduces the per-VM outcomes into a
//! [`JobResult`]. One VM's failure never aborts its siblings.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{AppConfig, HookConfig};

use super::hooks::{HookStage, run_hook};
use super::hypervisor::{Hypervisor, SnapshotError, VmInfo, VmListError, snapshot_name};
use super::layout::{DestinationPlan, plan_destination};
use super::models::{
    BackupMode, BackupSummary, JobRequest, JobResult, JobState, VmBackup, VmFailure, VmOutcome,
};
use super::transfer_engine::{TransferEngine, TransferError, TransferRequest};

/// Knobs the runner takes from the daemon configuration.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub parallel_vms: usize,
    pub require_snapshots: bool,
    pub snapshot_timeout: Duration,
    pub transfer_timeout: Duration,
    pub remote_root: String,
    pub keep_archives: usize,
    pub hooks: HookConfig,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl RunnerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            parallel_vms: config.parallel_vms.max(1),
            require_snapshots: config.require_snapshots,
            snapshot_timeout: config.snapshot_timeout(),
            transfer_timeout: config.transfer_timeout(),
            remote_root: config.remote.backup_dir.clone(),
            keep_archives: config.keep_archives,
            hooks: config.hooks.clone(),
        }
    }
}

/// One lock per VM, shared by every job of the daemon, so a VM is only ever
/// snapshotted and transferred by one job at a time.
#[derive(Clone, Default)]
pub struct VmLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl VmLocks {
    pub async fn acquire(&self, vm: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(vm.to_string())
            .or_default()
            .clone();

        match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Another job is backing up this VM, waiting");
                lock.lock_owned().await
            }
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    hypervisor: Arc<dyn Hypervisor>,
    transfer: Arc<dyn TransferEngine>,
    settings: Arc<RunnerSettings>,
    vm_locks: VmLocks,
}

impl JobRunner {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        transfer: Arc<dyn TransferEngine>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            hypervisor,
            transfer,
            settings: Arc::new(settings),
            vm_locks: VmLocks::default(),
        }
    }

    /// Share per-VM locks with other runners of the same daemon.
    pub fn with_vm_locks(mut self, vm_locks: VmLocks) -> Self {
        self.vm_locks = vm_locks;
        self
    }

    /// Run the pre-backup hook, back up every VM in `request`, then run the
    /// post-backup hook. Hook failures become job warnings. Dry runs skip
    /// both hooks.
    pub async fn run(&self, job_id: &str, request: &JobRequest) -> JobResult {
        let mut warnings = Vec::new();

        if !request.dry_run {
            if let Some(script) = &self.settings.hooks.pre_backup {
                warnings.extend(self.hook(HookStage::PreBackup, script, job_id, request, None).await);
            }
        }

        let mut result = self.back_up_vms(job_id, request).await;

        if !request.dry_run {
            if let Some(script) = &self.settings.hooks.post_backup {
                let state = Some(result.state);
                warnings.extend(self.hook(HookStage::PostBackup, script, job_id, request, state).await);
            }
        }

        result.warnings.extend(warnings);
        result
    }

    async fn hook(
        &self,
        stage: HookStage,
        script: &Path,
        job_id: &str,
        request: &JobRequest,
        state: Option<JobState>,
    ) -> Option<String> {
        let limit = self.settings.hooks.timeout();
        match run_hook(stage, script, limit, job_id, request, state).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Hook failed, continuing");
                Some(e.to_string())
            }
        }
    }

    /// Back up every VM in `request`, at most `parallel_vms` at a time.
    /// Outcomes keep the order of `request.vms`.
    async fn back_up_vms(&self, job_id: &str, request: &JobRequest) -> JobResult {
        let started_at = Utc::now();

        let inventory = match self.list_vms().await {
            Ok(vms) => vms
                .into_iter()
                .map(|vm| (vm.name.clone(), vm))
                .collect::<HashMap<_, _>>(),
            Err(e) => {
                warn!(error = %e, "Could not list VMs, failing every VM in the job");
                let outcomes = request
                    .vms
                    .iter()
                    .map(|vm| failure(vm, None, e.to_string()))
                    .collect();
                return JobResult::from_outcomes(outcomes);
            }
        };

        let permits = Arc::new(Semaphore::new(self.settings.parallel_vms));
        let mut tasks = JoinSet::new();

        for (index, vm) in request.vms.iter().enumerate() {
            let runner = self.clone();
            let permits = permits.clone();
            let info = inventory.get(vm).cloned();
            let vm = vm.clone();
            let job_id = job_id.to_string();
            let request = request.clone();
            let span = info_span!("vm_backup", vm = %vm);

            tasks.spawn(
                async move {
                    // The semaphore is never closed.
                    let _permit = permits.acquire_owned().await.ok();
                    let outcome = runner
                        .backup_vm(&job_id, &vm, info, &request, started_at)
                        .await;
                    (index, outcome)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<VmOutcome>> = vec![None; request.vms.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "VM backup task panicked"),
            }
        }

        let outcomes = slots
            .into_iter()
            .zip(&request.vms)
            .map(|(slot, vm)| {
                slot.unwrap_or_else(|| failure(vm, None, "backup task panicked".to_string()))
            })
            .collect();

        JobResult::from_outcomes(outcomes)
    }

    pub async fn list_vms(&self) -> Result<Vec<VmInfo>, VmListError> {
        let limit = self.settings.snapshot_timeout;
        match timeout(limit, self.hypervisor.list()).await {
            Ok(result) => result,
            Err(_) => Err(VmListError::Timeout(limit.as_secs())),
        }
    }

    async fn backup_vm(
        &self,
        job_id: &str,
        vm: &str,
        info: Option<VmInfo>,
        request: &JobRequest,
        started_at: DateTime<Utc>,
    ) -> VmOutcome {
        let Some(info) = info else {
            warn!("VM not found on the hypervisor");
            return failure(vm, None, format!("VM '{}' not found on the hypervisor", vm));
        };

        let plan = plan_destination(
            &self.settings.remote_root,
            vm,
            request.mode,
            started_at,
            job_id,
            self.settings.keep_archives,
        );
        let wants_snapshot = request.use_snapshots || request.mode == BackupMode::Snapshot;
        let snapshot = snapshot_name(started_at, job_id);

        if request.dry_run {
            return self.describe(&info, &plan, wants_snapshot.then_some(snapshot));
        }

        let _vm_lock = self.vm_locks.acquire(vm).await;

        let mut warnings = Vec::new();
        let mut taken = None;

        if wants_snapshot {
            match self.create_snapshot(vm, &snapshot).await {
                Ok(()) => {
                    info!(snapshot = %snapshot, "Snapshot created");
                    taken = Some(snapshot);
                }
                Err(e) if request.mode == BackupMode::Snapshot || self.settings.require_snapshots => {
                    warn!(error = %e, "Snapshot failed");
                    return failure(vm, None, e.to_string());
                }
                Err(e) => {
                    warn!(error = %e, "Snapshot failed, copying live disks");
                    warnings.push(e.to_string());
                }
            }
        }

        let mut paths = Vec::new();
        let mut transferred_bytes = 0;

        if plan.transfers_data() {
            match self.transfer_vm(job_id, &info, &plan).await {
                Ok((sent, bytes)) => {
                    paths = sent.iter().map(|path| plan.published_path(path)).collect();
                    transferred_bytes = bytes;
                }
                Err(e) => {
                    warn!(error = %e, "Transfer failed");
                    return self.abandon(vm, taken, e.to_string()).await;
                }
            }

            let summary = BackupSummary {
                job_id: job_id.to_string(),
                vm: vm.to_string(),
                mode: request.mode,
                job_vms: request.vms.clone(),
                started_at,
                finished_at: Utc::now(),
                snapshot: taken.clone(),
                transferred_bytes,
                files: paths.clone(),
                warnings: warnings.clone(),
            };
            if let Err(e) = self.upload_summary(&plan, &summary).await {
                warn!(error = %e, "Could not write backup summary");
                warnings.push(e.to_string());
            }

            let published = bounded(
                self.settings.transfer_timeout,
                self.transfer.finalize(&plan),
                |secs| TransferError::Timeout {
                    path: plan.target_dir.clone(),
                    secs,
                },
            )
            .await;
            if let Err(e) = published {
                warn!(error = %e, "Publishing the generation failed");
                return self.abandon(vm, taken, e.to_string()).await;
            }
        }

        let mut snapshot_retained = false;
        if let Some(name) = &taken {
            if request.mode == BackupMode::Snapshot {
                snapshot_retained = true;
            } else if let Err(e) = self.delete_snapshot(vm, name).await {
                warn!(snapshot = %name, error = %e, "Snapshot cleanup failed, backup kept");
                warnings.push(e.to_string());
                snapshot_retained = true;
            }
        }

        info!(
            bytes = transferred_bytes,
            target = %plan.target_dir,
            mode = %request.mode,
            "VM backup complete"
        );

        VmOutcome::Succeeded(VmBackup {
            vm: vm.to_string(),
            snapshot: taken,
            snapshot_retained,
            transferred_bytes,
            paths,
            warnings,
        })
    }

    /// Fail the VM, removing the snapshot this job took for it.
    async fn abandon(&self, vm: &str, taken: Option<String>, error: String) -> VmOutcome {
        if let Some(name) = &taken {
            if let Err(cleanup) = self.delete_snapshot(vm, name).await {
                warn!(snapshot = %name, error = %cleanup, "Could not remove snapshot of failed backup");
            }
        }
        failure(vm, taken, error)
    }

    /// Clear the staging directory, then push every disk and the VM
    /// definition into it. Stops at the first failing transfer.
    async fn transfer_vm(
        &self,
        job_id: &str,
        info: &VmInfo,
        plan: &DestinationPlan,
    ) -> Result<(Vec<String>, u64), TransferError> {
        let limit = self.settings.transfer_timeout;
        bounded(limit, self.transfer.prepare(plan), |secs| TransferError::Timeout {
            path: plan.staging_dir.clone(),
            secs,
        })
        .await?;

        let link_dest = |sub: &str| plan.link_dest.as_ref().map(|dir| format!("{}/{}", dir, sub));
        let mut requests: Vec<TransferRequest> = info
            .disk_paths
            .iter()
            .map(|disk| self.request(job_id, info, disk, plan.disk_dir(), link_dest("images"), plan))
            .collect();
        if let Some(definition) = &info.definition_path {
            requests.push(self.request(
                job_id,
                info,
                definition,
                plan.config_dir(),
                link_dest("config"),
                plan,
            ));
        }

        let mut paths = Vec::with_capacity(requests.len());
        let mut total = 0;
        for request in &requests {
            debug!(source = %request.local_path.display(), destination = %request.remote_path(), "Transferring");
            let result = bounded(limit, self.transfer.transfer(request), |secs| {
                TransferError::Timeout {
                    path: request.local_path.display().to_string(),
                    secs,
                }
            })
            .await?;
            total += result.transferred_bytes;
            paths.push(result.remote_path);
        }

        Ok((paths, total))
    }

    /// Write the summary into the staging directory so it is published with
    /// the data it describes.
    async fn upload_summary(
        &self,
        plan: &DestinationPlan,
        summary: &BackupSummary,
    ) -> Result<(), TransferError> {
        let contents = serde_json::to_vec_pretty(summary).map_err(|e| TransferError::Failed {
            path: BackupSummary::FILE_NAME.to_string(),
            reason: e.to_string(),
        })?;
        let target = format!("{}/{}", plan.staging_dir, BackupSummary::FILE_NAME);
        bounded(
            self.settings.transfer_timeout,
            self.transfer
                .upload(&plan.staging_dir, BackupSummary::FILE_NAME, contents),
            |secs| TransferError::Timeout { path: target, secs },
        )
        .await
        .map(|_| ())
    }

    fn request(
        &self,
        job_id: &str,
        info: &VmInfo,
        local_path: &Path,
        remote_dir: String,
        link_dest: Option<String>,
        plan: &DestinationPlan,
    ) -> TransferRequest {
        TransferRequest {
            job_id: job_id.to_string(),
            vm: info.name.clone(),
            local_path: local_path.to_path_buf(),
            remote_dir,
            mode: plan.mode,
            link_dest,
        }
    }

    async fn create_snapshot(&self, vm: &str, name: &str) -> Result<(), SnapshotError> {
        bounded(
            self.settings.snapshot_timeout,
            self.hypervisor.create(vm, name),
            |secs| SnapshotError::Timeout {
                vm: vm.to_string(),
                snapshot: name.to_string(),
                secs,
            },
        )
        .await
        .map(|_| ())
    }

    async fn delete_snapshot(&self, vm: &str, name: &str) -> Result<(), SnapshotError> {
        bounded(
            self.settings.snapshot_timeout,
            self.hypervisor.delete(vm, name),
            |secs| SnapshotError::Timeout {
                vm: vm.to_string(),
                snapshot: name.to_string(),
                secs,
            },
        )
        .await
    }

    /// Dry run: log what would happen and report it without side effects.
    fn describe(&self, info: &VmInfo, plan: &DestinationPlan, snapshot: Option<String>) -> VmOutcome {
        if let Some(name) = &snapshot {
            info!(snapshot = %name, "(Dry run) Would create snapshot");
        }

        let mut paths = Vec::new();
        if plan.transfers_data() {
            let mut staged = info
                .disk_paths
                .iter()
                .map(|disk| self.request("dry-run", info, disk, plan.disk_dir(), None, plan))
                .collect::<Vec<_>>();
            if let Some(definition) = &info.definition_path {
                staged.push(self.request("dry-run", info, definition, plan.config_dir(), None, plan));
            }
            for request in &staged {
                let destination = plan.published_path(&request.remote_path());
                info!(source = %request.local_path.display(), destination = %destination, "(Dry run) Would transfer");
                paths.push(destination);
            }
            for rotation in &plan.rotations {
                info!(from = %rotation.from, to = %rotation.to, "(Dry run) Would rotate");
            }
            info!(target = %plan.target_dir, "(Dry run) Would publish");
        }

        VmOutcome::Succeeded(VmBackup {
            vm: info.name.clone(),
            snapshot: None,
            snapshot_retained: false,
            transferred_bytes: 0,
            paths,
            warnings: vec!["dry run, nothing was changed".to_string()],
        })
    }
}

async fn bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(u64) -> E,
) -> Result<T, E> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit.as_secs())),
    }
}

fn failure(vm: &str, snapshot: Option<String>, error: String) -> VmOutcome {
    VmOutcome::Failed(VmFailure {
        vm: vm.to_string(),
        snapshot,
        error,
        failed_at: Utc::now(),
    })
}
