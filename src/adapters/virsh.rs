use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::debug;

use crate::core::hypervisor::{
    SnapshotError, SnapshotManager, SnapshotRef, VmInfo, VmListError, VmLister,
};

const DEFINITION_DIR: &str = "/etc/libvirt/qemu";

/// Libvirt access through the `virsh` command line client.
pub struct VirshHypervisor {
    uri: String,
}

impl VirshHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    async fn virsh(&self, args: &[&str]) -> Result<String, String> {
        debug!(uri = %self.uri, args = ?args, "(Virsh) Running");

        let output = Command::new("virsh")
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run virsh: {}", e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(format!(
                "virsh {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[async_trait]
impl VmLister for VirshHypervisor {
    async fn list(&self) -> Result<Vec<VmInfo>, VmListError> {
        let names = self
            .virsh(&["list", "--all", "--name"])
            .await
            .map_err(VmListError::Failed)?;

        let mut vms = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            let state = self
                .virsh(&["domstate", name])
                .await
                .map_err(VmListError::Failed)?;
            let blklist = self
                .virsh(&["domblklist", name, "--details"])
                .await
                .map_err(VmListError::Failed)?;

            let definition = Path::new(DEFINITION_DIR).join(format!("{}.xml", name));
            vms.push(VmInfo {
                name: name.to_string(),
                running: state.trim() == "running",
                disk_paths: parse_domblklist(&blklist),
                definition_path: definition.exists().then_some(definition),
            });
        }

        Ok(vms)
    }
}

#[async_trait]
impl SnapshotManager for VirshHypervisor {
    async fn create(&self, vm: &str, name: &str) -> Result<SnapshotRef, SnapshotError> {
        self.virsh(&[
            "snapshot-create-as",
            "--domain",
            vm,
            "--name",
            name,
            "--description",
            "Automated backup snapshot",
            "--atomic",
        ])
        .await
        .map_err(|reason| SnapshotError::Failed {
            vm: vm.to_string(),
            snapshot: name.to_string(),
            reason,
        })?;

        Ok(SnapshotRef {
            vm: vm.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn delete(&self, vm: &str, name: &str) -> Result<(), SnapshotError> {
        self.virsh(&["snapshot-delete", "--domain", vm, "--snapshotname", name])
            .await
            .map(|_| ())
            .map_err(|reason| SnapshotError::Failed {
                vm: vm.to_string(),
                snapshot: name.to_string(),
                reason,
            })
    }
}

/// File-backed disks from `virsh domblklist --details` output.
pub fn parse_domblklist(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let (kind, device, _target) = (cols.next()?, cols.next()?, cols.next()?);
            let source = cols.collect::<Vec<_>>().join(" ");
            (kind == "file" && device == "disk" && !source.is_empty() && source != "-")
                .then(|| PathBuf::from(source))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domblklist_keeps_file_disks_only() {
        let output = "\
 Type   Device   Target   Source
------------------------------------------------------------
 file   disk     vda      /var/lib/libvirt/images/web01.qcow2
 file   disk     vdb      /var/lib/libvirt/images/web01 data.qcow2
 file   cdrom    sda      -
 block  disk     vdc      /dev/sdb
";
        assert_eq!(
            parse_domblklist(output),
            vec![
                PathBuf::from("/var/lib/libvirt/images/web01.qcow2"),
                PathBuf::from("/var/lib/libvirt/images/web01 data.qcow2"),
            ]
        );
    }
}
