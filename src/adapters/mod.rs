use std::sync::Arc;

use crate::core::hypervisor::Hypervisor;

mod simulated;
mod virsh;

pub use simulated::SimulatedHypervisor;
pub use virsh::{VirshHypervisor, parse_domblklist};

pub fn get_hypervisor(simulation: bool, libvirt_uri: &str) -> Arc<dyn Hypervisor> {
    if simulation {
        return Arc::new(SimulatedHypervisor::with_demo_vms());
    }

    Arc::new(VirshHypervisor::new(libvirt_uri))
}
