//! Architecture-specific hardware generation.
//!
//! One [`ArchStrategy`] exists per CPU family. The controller picks it from the detected
//! host architecture and keeps it for its lifetime.

mod aarch64;
mod x86_64;

use std::path::{Path, PathBuf};

use hostman_system::{Arch, CpuCount};
use thiserror::Error;

use crate::{
    desc::{
        Accel, Bios, CharDev, CpuDesc, Device, GuestDesc, IsaSerialDesc, MachineDesc, MachineType,
        MemDesc, Object, OsName, PvpanicDesc, QgaDesc,
    },
    host::HostInfo,
    paths::hugepages_dir,
};

pub use self::aarch64::Aarch64Strategy;
pub use self::x86_64::X86Strategy;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchStrategyError {
    #[error("unsupported cpu max for qemu machine: {machine}")]
    CpuMax { machine: MachineType },

    #[error("cpu count {cpus} exceeds max {max} for qemu machine: {machine}")]
    TooManyCpus {
        cpus: u16,
        max: u32,
        machine: MachineType,
    },
}

pub trait ArchStrategy: Send + Sync + std::fmt::Debug {
    fn arch(&self) -> Arch;

    fn generate_cpu_desc(
        &self,
        cpus: CpuCount,
        desc: &GuestDesc,
        host: &dyn HostInfo,
    ) -> Result<CpuDesc, ArchStrategyError>;

    fn generate_mem_desc(&self, size_mb: u64, backend: &MemBackend) -> MemDesc;

    fn generate_machine_desc(
        &self,
        desc: &GuestDesc,
        accel: Accel,
        host: &dyn HostInfo,
    ) -> MachineDesc;

    fn generate_qga_desc(&self, socket_path: &Path) -> QgaDesc;

    fn generate_pvpanic_desc(&self) -> PvpanicDesc;

    /// `None` when the architecture has no ISA bus.
    fn generate_isa_serial_desc(&self) -> Option<IsaSerialDesc>;
}

pub fn strategy_for(arch: Arch) -> Box<dyn ArchStrategy> {
    match arch {
        Arch::X86_64 => Box::new(X86Strategy),
        Arch::Aarch64 => Box::new(Aarch64Strategy),
    }
}

pub fn accel_for(host: &dyn HostInfo) -> Accel {
    if host.is_kvm_support() {
        Accel::Kvm
    } else {
        Accel::Tcg
    }
}

/// Looks up the vCPU ceiling and checks the requested count against it.
fn cpu_max(
    cpus: CpuCount,
    machine: MachineType,
    host: &dyn HostInfo,
) -> Result<u32, ArchStrategyError> {
    let max = host
        .cpu_max(machine)
        .ok_or(ArchStrategyError::CpuMax { machine })?;
    if u32::from(cpus.get()) > max {
        return Err(ArchStrategyError::TooManyCpus {
            cpus: cpus.get(),
            max,
            machine,
        });
    }
    Ok(max)
}

/// Coerce machine type and firmware to what the guest OS and host can boot.
pub fn fix_guest_machine_type(desc: &mut GuestDesc, arch: Arch) {
    if desc.metadata.os_name == OsName::MacOs {
        desc.machine = Some(MachineType::Q35);
        desc.bios = Bios::Uefi;
    }
    if arch == Arch::Aarch64 {
        if matches!(desc.machine, None | Some(MachineType::Pc | MachineType::Q35)) {
            desc.machine = Some(MachineType::ArmVirt);
        }
        desc.bios = Bios::Uefi;
    }
}

/// Memory backend selected from host capabilities and guest metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemBackend {
    Hugepages { mem_path: PathBuf },
    Memfd,
    Ram,
}

impl MemBackend {
    pub fn select(desc: &GuestDesc, host: &dyn HostInfo) -> Self {
        if host.is_hugepages_enabled() {
            MemBackend::Hugepages {
                mem_path: hugepages_dir(&host.options().hugepages_path, desc.uuid()),
            }
        } else if desc.metadata.enable_memclean {
            MemBackend::Memfd
        } else {
            MemBackend::Ram
        }
    }

    pub fn obj_type(&self) -> &'static str {
        match self {
            MemBackend::Hugepages { .. } => "memory-backend-file",
            MemBackend::Memfd => "memory-backend-memfd",
            MemBackend::Ram => "memory-backend-ram",
        }
    }

    pub fn object(&self, id: &str, size_mb: u64) -> Object {
        let obj = Object::new(self.obj_type(), id).with("size", format!("{size_mb}M"));
        match self {
            MemBackend::Hugepages { mem_path } => obj
                .with("mem-path", mem_path.display().to_string())
                .with("share", "on")
                .with("prealloc", "on"),
            MemBackend::Memfd => obj.with("share", "on").with("prealloc", "on"),
            MemBackend::Ram => obj,
        }
    }
}

fn qga_desc(socket_path: &Path) -> QgaDesc {
    QgaDesc {
        socket: CharDev::new("socket", "qga0")
            .with("path", socket_path.display().to_string())
            .with("server", "on")
            .with("wait", "off"),
        serial_bus: Device::new("virtio-serial-pci", "virtio-serial0"),
        port: Device::new("virtserialport", "qga0-port")
            .with("bus", "virtio-serial0.0")
            .with("chardev", "qga0")
            .with("name", "org.qemu.guest_agent.0"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing;

    fn desc() -> GuestDesc {
        GuestDesc::new("0f2b7c4e-uuid", CpuCount::new(2), 2048)
    }

    #[test]
    fn aarch64_forces_virt_and_uefi() {
        let mut desc = desc();
        fix_guest_machine_type(&mut desc, Arch::Aarch64);
        assert_eq!(desc.machine, Some(MachineType::ArmVirt));
        assert_eq!(desc.bios, Bios::Uefi);
    }

    #[test]
    fn macos_forces_q35_and_uefi() {
        let mut desc = desc();
        desc.metadata.os_name = OsName::MacOs;
        fix_guest_machine_type(&mut desc, Arch::X86_64);
        assert_eq!(desc.machine, Some(MachineType::Q35));
        assert_eq!(desc.bios, Bios::Uefi);
    }

    #[test]
    fn x86_keeps_requested_machine() {
        let mut desc = desc();
        fix_guest_machine_type(&mut desc, Arch::X86_64);
        assert_eq!(desc.machine, None);
        assert_eq!(desc.bios, Bios::Legacy);
    }

    #[test]
    fn backend_selection() {
        let desc = desc();
        let host = testing::host(Arch::X86_64);
        assert_eq!(MemBackend::select(&desc, &host), MemBackend::Ram);

        let mut memclean = desc.clone();
        memclean.metadata.enable_memclean = true;
        assert_eq!(MemBackend::select(&memclean, &host), MemBackend::Memfd);

        let mut caps = testing::caps(Arch::X86_64);
        caps.hugepage_size = Some(hostman_system::MemorySize::from_kb(2048));
        let host = crate::host::Host::new(caps, testing::options());
        assert_eq!(
            MemBackend::select(&memclean, &host),
            MemBackend::Hugepages {
                mem_path: PathBuf::from("/dev/hugepages/0f2b7c4e-uuid")
            }
        );
    }

    #[test]
    fn hugepage_backend_object() {
        let backend = MemBackend::Hugepages {
            mem_path: PathBuf::from("/dev/hugepages/u"),
        };
        assert_eq!(
            backend.object("mem", 1024).to_string(),
            "memory-backend-file,id=mem,mem-path=/dev/hugepages/u,prealloc=on,share=on,size=1024M"
        );
    }

    #[test]
    fn cpu_max_errors_on_wrong_machine() {
        let host = testing::host(Arch::X86_64);
        let mut desc = desc();
        desc.machine = Some(MachineType::ArmVirt);
        let err = strategy_for(Arch::X86_64)
            .generate_cpu_desc(desc.cpu, &desc, &host)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported cpu max for qemu machine: virt"
        );
    }
}
