use hostman_system::{Arch, HostCaps, MemorySize};

use crate::{
    desc::MachineType,
    options::{BridgeDev, HostOptions},
};

/// Read-only view of the host a guest is rendered for.
pub trait HostInfo: Send + Sync {
    fn arch(&self) -> Arch;
    fn is_kvm_support(&self) -> bool;
    fn is_nested_virtualization(&self) -> bool;
    fn is_hugepages_enabled(&self) -> bool;
    fn hugepage_size_kb(&self) -> u64;
    fn kernel_version(&self) -> &str;
    fn bridge_dev(&self, bridge: &str) -> Option<BridgeDev>;
    /// Highest vCPU count the machine type supports on this host.
    fn cpu_max(&self, machine: MachineType) -> Option<u32>;
    fn options(&self) -> &HostOptions;
}

/// Detected capabilities plus the agent configuration.
#[derive(Debug, Clone)]
pub struct Host {
    caps: HostCaps,
    options: HostOptions,
}

impl Host {
    pub fn new(caps: HostCaps, options: HostOptions) -> Self {
        Self { caps, options }
    }
}

fn default_cpu_max(arch: Arch, machine: MachineType) -> Option<u32> {
    match (arch, machine) {
        (Arch::X86_64, MachineType::Pc) => Some(255),
        (Arch::X86_64, MachineType::Q35) => Some(288),
        (Arch::Aarch64, MachineType::ArmVirt) => Some(512),
        _ => None,
    }
}

impl HostInfo for Host {
    fn arch(&self) -> Arch {
        self.caps.arch
    }

    fn is_kvm_support(&self) -> bool {
        self.caps.kvm && !self.options.disable_kvm
    }

    fn is_nested_virtualization(&self) -> bool {
        self.caps.nested_virt
    }

    fn is_hugepages_enabled(&self) -> bool {
        self.caps.is_hugepages_enabled()
    }

    fn hugepage_size_kb(&self) -> u64 {
        self.caps
            .hugepage_size
            .map(|size: MemorySize| size.as_kb())
            .unwrap_or(0)
    }

    fn kernel_version(&self) -> &str {
        &self.caps.kernel_version
    }

    fn bridge_dev(&self, bridge: &str) -> Option<BridgeDev> {
        self.options.bridges.get(bridge).cloned()
    }

    fn cpu_max(&self, machine: MachineType) -> Option<u32> {
        self.options
            .machine_cpu_max
            .get(machine.as_str())
            .copied()
            .or_else(|| default_cpu_max(self.caps.arch, machine))
    }

    fn options(&self) -> &HostOptions {
        &self.options
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use super::*;
    use crate::options::BridgeDriver;

    pub fn caps(arch: Arch) -> HostCaps {
        HostCaps {
            arch,
            kvm: true,
            nested_virt: false,
            hugepage_size: None,
            kernel_version: "6.1.0".to_owned(),
        }
    }

    pub fn options() -> HostOptions {
        let mut bridges = BTreeMap::new();
        bridges.insert(
            "br0".to_owned(),
            BridgeDev {
                device: "br0".to_owned(),
                driver: BridgeDriver::Linux,
            },
        );
        bridges.insert(
            "vpc".to_owned(),
            BridgeDev {
                device: "brvpc".to_owned(),
                driver: BridgeDriver::Openvswitch,
            },
        );
        HostOptions {
            bridges,
            ..Default::default()
        }
    }

    pub fn host(arch: Arch) -> Host {
        Host::new(caps(arch), options())
    }
}

#[cfg(test)]
mod tests {
    use super::testing;
    use super::*;

    #[test]
    fn cpu_max_by_machine() {
        let host = testing::host(Arch::X86_64);
        assert_eq!(host.cpu_max(MachineType::Pc), Some(255));
        assert_eq!(host.cpu_max(MachineType::Q35), Some(288));
        assert_eq!(host.cpu_max(MachineType::ArmVirt), None);

        let host = testing::host(Arch::Aarch64);
        assert_eq!(host.cpu_max(MachineType::ArmVirt), Some(512));
        assert_eq!(host.cpu_max(MachineType::Pc), None);
    }

    #[test]
    fn cpu_max_override() {
        let mut options = testing::options();
        options.machine_cpu_max.insert("pc".to_owned(), 64);
        let host = Host::new(testing::caps(Arch::X86_64), options);
        assert_eq!(host.cpu_max(MachineType::Pc), Some(64));
    }

    #[test]
    fn kvm_can_be_disabled() {
        let mut options = testing::options();
        options.disable_kvm = true;
        let host = Host::new(testing::caps(Arch::X86_64), options);
        assert!(!host.is_kvm_support());
    }
}
