use std::path::{Path, PathBuf};

use hostman_system::{Arch, CpuCount};

use super::{ArchStrategy, ArchStrategyError, MemBackend, cpu_max, qga_desc};
use crate::{
    desc::{
        Accel, Bios, CharDev, CpuDesc, Device, Firmware, GuestDesc, IsaSerialDesc, MachineDesc,
        MemDesc, OsName, PvpanicDesc, QgaDesc,
    },
    host::HostInfo,
};

const OVMF_CODE: &str = "/usr/share/OVMF/OVMF_CODE.fd";
const MEM_SLOTS: u32 = 4;
const MAX_MEM_MB: u64 = 512 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct X86Strategy;

impl ArchStrategy for X86Strategy {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn generate_cpu_desc(
        &self,
        cpus: CpuCount,
        desc: &GuestDesc,
        host: &dyn HostInfo,
    ) -> Result<CpuDesc, ArchStrategyError> {
        let machine = desc.machine_or_default();
        let max_cpus = cpu_max(cpus, machine, host)?;
        let kvm = host.is_kvm_support();

        let mut features = Vec::new();
        let model = if kvm {
            features.push(if host.is_nested_virtualization() {
                "+vmx".to_owned()
            } else {
                "-vmx".to_owned()
            });
            if desc.metadata.os_name == OsName::Windows {
                features.extend(
                    ["hv_relaxed", "hv_spinlocks=0x1fff", "hv_vapic", "hv_time"].map(String::from),
                );
            }
            // Some GPU drivers refuse to load under a visible hypervisor.
            if desc.has_gpu() {
                features.push("kvm=off".to_owned());
            }
            "host"
        } else {
            "qemu64"
        };

        Ok(CpuDesc {
            model: model.to_owned(),
            features,
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
            slots: MEM_SLOTS,
            max_mem_mb: MAX_MEM_MB.max(size_mb),
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
        let firmware = match desc.bios {
            Bios::Uefi => Some(Firmware::Pflash(
                host.options()
                    .ovmf_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(OVMF_CODE)),
            )),
            Bios::Legacy => None,
        };
        MachineDesc {
            machine_type: desc.machine_or_default().as_str().to_owned(),
            accel,
            options: Default::default(),
            firmware,
        }
    }

    fn generate_qga_desc(&self, socket_path: &Path) -> QgaDesc {
        qga_desc(socket_path)
    }

    fn generate_pvpanic_desc(&self) -> PvpanicDesc {
        PvpanicDesc {
            device: Device::new("pvpanic", "pvpanic").with("ioport", "0x505"),
        }
    }

    fn generate_isa_serial_desc(&self) -> Option<IsaSerialDesc> {
        Some(IsaSerialDesc {
            chardev: CharDev::new("pty", "charserial0"),
            device: Device::new("isa-serial", "serial0").with("chardev", "charserial0"),
        })
    }
}
