use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::Utc;

use crate::core::hypervisor::{
    SnapshotError, SnapshotManager, SnapshotRef, VmInfo, VmListError, VmLister,
};

#[derive(Default)]
struct SimulatedState {
    vms: BTreeMap<String, VmInfo>,
    snapshots: BTreeMap<String, Vec<String>>,
    deleted: Vec<(String, String)>,
    failing_snapshots: HashSet<String>,
    failing_deletes: HashSet<String>,
    hanging_snapshots: HashSet<String>,
    list_failure: Option<String>,
}

/// In-memory hypervisor used by simulation mode and tests.
///
/// Cloning shares state, so a test can keep one handle as a controller while
/// the runner owns another.
#[derive(Clone, Default)]
pub struct SimulatedHypervisor {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hypervisor pre-populated with a couple of VMs for simulation mode.
    pub fn with_demo_vms() -> Self {
        let hypervisor = Self::new();
        hypervisor.add_vm("web01", true);
        hypervisor.add_vm("db01", true);
        hypervisor.add_vm("build01", false);
        hypervisor
    }

    pub fn add_vm(&self, name: &str, running: bool) {
        self.add_vm_info(VmInfo {
            name: name.to_string(),
            running,
            disk_paths: vec![PathBuf::from(format!("/var/lib/libvirt/images/{}.qcow2", name))],
            definition_path: Some(PathBuf::from(format!("/etc/libvirt/qemu/{}.xml", name))),
        });
    }

    pub fn add_vm_info(&self, info: VmInfo) {
        self.lock().vms.insert(info.name.clone(), info);
    }

    pub fn fail_snapshots_for(&self, vm: &str) {
        self.lock().failing_snapshots.insert(vm.to_string());
    }

    pub fn fail_deletes_for(&self, vm: &str) {
        self.lock().failing_deletes.insert(vm.to_string());
    }

    /// Snapshot creation for `vm` never completes.
    pub fn hang_snapshots_for(&self, vm: &str) {
        self.lock().hanging_snapshots.insert(vm.to_string());
    }

    pub fn fail_listing(&self, reason: &str) {
        self.lock().list_failure = Some(reason.to_string());
    }

    /// Snapshots currently present for `vm`.
    pub fn snapshots(&self, vm: &str) -> Vec<String> {
        self.lock().snapshots.get(vm).cloned().unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl VmLister for SimulatedHypervisor {
    async fn list(&self) -> Result<Vec<VmInfo>, VmListError> {
        let state = self.lock();
        if let Some(reason) = &state.list_failure {
            return Err(VmListError::Failed(reason.clone()));
        }
        Ok(state.vms.values().cloned().collect())
    }
}

#[async_trait]
impl SnapshotManager for SimulatedHypervisor {
    async fn create(&self, vm: &str, name: &str) -> Result<SnapshotRef, SnapshotError> {
        let hang = self.lock().hanging_snapshots.contains(vm);
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if state.failing_snapshots.contains(vm) || !state.vms.contains_key(vm) {
            return Err(SnapshotError::Failed {
                vm: vm.to_string(),
                snapshot: name.to_string(),
                reason: "simulated snapshot failure".to_string(),
            });
        }

        let existing = state.snapshots.entry(vm.to_string()).or_default();
        if existing.iter().any(|s| s == name) {
            return Err(SnapshotError::Failed {
                vm: vm.to_string(),
                snapshot: name.to_string(),
                reason: "snapshot already exists".to_string(),
            });
        }
        existing.push(name.to_string());

        Ok(SnapshotRef {
            vm: vm.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn delete(&self, vm: &str, name: &str) -> Result<(), SnapshotError> {
        let mut state = self.lock();
        if state.failing_deletes.contains(vm) {
            return Err(SnapshotError::Failed {
                vm: vm.to_string(),
                snapshot: name.to_string(),
                reason: "simulated delete failure".to_string(),
            });
        }

        let existing = state.snapshots.entry(vm.to_string()).or_default();
        let before = existing.len();
        existing.retain(|s| s != name);
        if existing.len() == before {
            return Err(SnapshotError::Failed {
                vm: vm.to_string(),
                snapshot: name.to_string(),
                reason: "no such snapshot".to_string(),
            });
        }

        state.deleted.push((vm.to_string(), name.to_string()));
        Ok(())
    }
}
