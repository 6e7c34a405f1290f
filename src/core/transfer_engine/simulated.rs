use crate::core::layout::DestinationPlan;
use crate::core::transfer_engine::{
    TransferEngine, TransferError, TransferFuture, TransferRequest, TransferResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

/// Size reported for paths that don't exist locally (simulation mode).
const SIMULATED_FILE_SIZE: u64 = 1024 * 1024 * 64;

/// A file written on the simulated backup host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub remote_path: String,
    pub contents: Vec<u8>,
}

#[derive(Default)]
struct SimulatedState {
    failing_vms: HashSet<String>,
    failing_finalize: HashSet<String>,
    failing_uploads: bool,
    prepared: Vec<DestinationPlan>,
    finalized: Vec<DestinationPlan>,
    sent: Vec<TransferRequest>,
    uploads: Vec<Upload>,
    /// Transfers currently running, and the most seen at once, per VM.
    active: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// In-process transfer engine that records every request instead of copying.
#[derive(Clone, Default)]
pub struct SimulatedEngine {
    state: Arc<Mutex<SimulatedState>>,
    delay: Duration,
}

impl SimulatedEngine {
    /// Make every transfer take at least `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make every transfer for `vm` fail.
    pub fn fail_vm(&self, vm: &str) {
        self.lock().failing_vms.insert(vm.to_string());
    }

    /// Make publishing `vm`'s generation fail.
    pub fn fail_finalize_for(&self, vm: &str) {
        self.lock().failing_finalize.insert(vm.to_string());
    }

    pub fn fail_uploads(&self) {
        self.lock().failing_uploads = true;
    }

    pub fn sent(&self) -> Vec<TransferRequest> {
        self.lock().sent.clone()
    }

    pub fn prepared(&self) -> Vec<DestinationPlan> {
        self.lock().prepared.clone()
    }

    pub fn finalized(&self) -> Vec<DestinationPlan> {
        self.lock().finalized.clone()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.lock().uploads.clone()
    }

    /// Most transfers that ever ran at the same time for `vm`.
    pub fn peak_concurrency(&self, vm: &str) -> usize {
        self.lock().peak.get(vm).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, vm: &str) {
        let mut state = self.lock();
        let active = state.active.entry(vm.to_string()).or_default();
        *active += 1;
        let now = *active;
        let peak = state.peak.entry(vm.to_string()).or_default();
        *peak = (*peak).max(now);
    }

    fn leave(&self, vm: &str) {
        if let Some(active) = self.lock().active.get_mut(vm) {
            *active = active.saturating_sub(1);
        }
    }
}

impl TransferEngine for SimulatedEngine {
    fn prepare(&self, plan: &DestinationPlan) -> TransferFuture<()> {
        self.lock().prepared.push(plan.clone());
        Box::pin(async { Ok(()) })
    }

    fn transfer(&self, req: &TransferRequest) -> TransferFuture<TransferResult> {
        let req = req.clone();
        let engine = self.clone();

        Box::pin(async move {
            let start_time = Instant::now();
            engine.enter(&req.vm);
            if engine.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(engine.delay).await;
            }
            engine.leave(&req.vm);

            if engine.lock().failing_vms.contains(&req.vm) {
                return Err(TransferError::Failed {
                    path: req.local_path.display().to_string(),
                    reason: "simulated transfer failure".to_string(),
                });
            }

            let transferred_bytes = std::fs::metadata(&req.local_path)
                .map(|m| m.len())
                .unwrap_or(SIMULATED_FILE_SIZE);

            info!(
                source = %req.local_path.display(),
                destination = %req.remote_path(),
                bytes = transferred_bytes,
                "(Simulated) Transfer complete"
            );

            engine.lock().sent.push(req.clone());

            Ok(TransferResult {
                remote_path: req.remote_path(),
                transferred_bytes,
                duration_secs: start_time.elapsed().as_secs(),
            })
        })
    }

    fn upload(&self, remote_dir: &str, name: &str, contents: Vec<u8>) -> TransferFuture<TransferResult> {
        let remote_path = format!("{}/{}", remote_dir, name);
        let mut state = self.lock();
        if state.failing_uploads {
            return Box::pin(async move {
                Err(TransferError::Failed {
                    path: remote_path,
                    reason: "simulated upload failure".to_string(),
                })
            });
        }

        let transferred_bytes = contents.len() as u64;
        state.uploads.push(Upload {
            remote_path: remote_path.clone(),
            contents,
        });
        info!(destination = %remote_path, bytes = transferred_bytes, "(Simulated) Upload complete");

        Box::pin(async move {
            Ok(TransferResult {
                remote_path,
                transferred_bytes,
                duration_secs: 0,
            })
        })
    }

    fn finalize(&self, plan: &DestinationPlan) -> TransferFuture<()> {
        let mut state = self.lock();
        if state.failing_finalize.contains(&plan.vm) {
            let target = plan.target_dir.clone();
            return Box::pin(async move {
                Err(TransferError::Finalize {
                    target,
                    reason: "simulated publish failure".to_string(),
                })
            });
        }
        state.finalized.push(plan.clone());
        Box::pin(async { Ok(()) })
    }
}
