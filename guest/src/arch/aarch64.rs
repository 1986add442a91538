use std::path::{Path, PathBuf};

use hostman_system::{Arch, CpuCount};

use super::{ArchStrategy, ArchStrategyError, MemBackend, cpu_max, qga_desc};
use crate::{
    desc::{
        Accel, CpuDesc, Device, Firmware, GuestDesc, IsaSerialDesc, MachineDesc, MachineType,
        MemDesc, PvpanicDesc, QgaDesc,
    },
    host::HostInfo,
};

const AAVMF_CODE: &str = "/usr/share/AAVMF/AAVMF_CODE.fd";

#[derive(Debug, Clone, Copy, Default)]
pub struct Aarch64Strategy;

impl ArchStrategy for Aarch64Strategy {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn generate_cpu_desc(
        &self,
        cpus: CpuCount,
        desc: &GuestDesc,
        host: &dyn HostInfo,
    ) -> Result<CpuDesc, ArchStrategyError> {
        let machine = desc.machine.unwrap_or(MachineType::ArmVirt);
        let max_cpus = cpu_max(cpus, machine, host)?;
        let kvm = host.is_kvm_support();

        Ok(CpuDesc {
            model: if kvm { "host" } else { "max" }.to_owned(),
            features: Vec::new(),
            accel: if kvm { Accel::Kvm } else { Accel::Tcg },
            cpus: cpus.get(),
            sockets: u16::try_from(max_cpus).unwrap_or(u16::MAX),
            cores: 1,
            threads: 1,
            max_cpus,
        })
    }

    fn generate_mem_desc(&self, size_mb: u64, backend: &MemBackend) -> MemDesc {
        MemDesc {
            size_mb,
            slots: 0,
            max_mem_mb: size_mb,
            mem: backend.object("mem", size_mb),
            mem_slots: Vec::new(),
        }
    }

    fn generate_machine_desc(
        &self,
        desc: &GuestDesc,
        accel: Accel,
        host: &dyn HostInfo,
    ) -> MachineDesc {
        let gic_version = match accel {
            Accel::Kvm => "host",
            Accel::Tcg => "3",
        };
        let mut options = std::collections::BTreeMap::new();
        options.insert("gic-version".to_owned(), gic_version.to_owned());

        MachineDesc {
            machine_type: desc
                .machine
                .unwrap_or(MachineType::ArmVirt)
                .as_str()
                .to_owned(),
            accel,
            options,
            firmware: Some(Firmware::Bios(
                host.options()
                    .ovmf_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(AAVMF_CODE)),
            )),
        }
    }

    fn generate_qga_desc(&self, socket_path: &Path) -> QgaDesc {
        qga_desc(socket_path)
    }

    fn generate_pvpanic_desc(&self) -> PvpanicDesc {
        PvpanicDesc {
            device: Device::new("pvpanic-pci", "pvpanic"),
        }
    }

    fn generate_isa_serial_desc(&self) -> Option<IsaSerialDesc> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing;

    #[test]
    fn virt_machine_with_host_gic() {
        let host = testing::host(Arch::Aarch64);
        let mut desc = GuestDesc::new("u", CpuCount::new(2), 2048);
        desc.machine = Some(MachineType::ArmVirt);
        let machine = Aarch64Strategy.generate_machine_desc(&desc, Accel::Kvm, &host);
        assert_eq!(machine.machine_arg(), "virt,accel=kvm,gic-version=host");
        assert_eq!(
            machine.firmware,
            Some(Firmware::Bios(PathBuf::from(AAVMF_CODE)))
        );
    }

    #[test]
    fn tcg_cpu_uses_max_model() {
        let mut caps = testing::caps(Arch::Aarch64);
        caps.kvm = false;
        let host = crate::host::Host::new(caps, testing::options());
        let desc = GuestDesc::new("u", CpuCount::new(2), 2048);
        let cpu = Aarch64Strategy
            .generate_cpu_desc(desc.cpu, &desc, &host)
            .unwrap();
        assert_eq!(cpu.model, "max");
        assert_eq!(cpu.accel, Accel::Tcg);
        assert_eq!(cpu.max_cpus, 512);
    }

    #[test]
    fn no_isa_bus() {
        assert!(Aarch64Strategy.generate_isa_serial_desc().is_none());
    }
}
