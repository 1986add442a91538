use thiserror::Error;

use crate::{
    arch::{ArchStrategy, MemBackend},
    desc::{GuestDesc, MemDevice, MemSlot},
    host::HostInfo,
    monitor::MemoryDeviceInfo,
};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unsupported memory device type {0}")]
    UnsupportedDevice(String),

    #[error("wrong memsize {0}")]
    WrongSize(u64),

    #[error("guest {uuid} has {actual}M of memory objects but {expected}M configured")]
    Mismatch {
        uuid: String,
        expected: u64,
        actual: u64,
    },
}

/// Rebuilds the memory descriptor from the DIMMs a running QEMU reports.
///
/// Boot memory is whatever the descriptor's size leaves after the hot-plugged slots.
pub fn init_mem_desc_from_memory_info(
    desc: &mut GuestDesc,
    devices: &[MemoryDeviceInfo],
    strategy: &dyn ArchStrategy,
    host: &dyn HostInfo,
) -> Result<(), MemoryError> {
    let backend = MemBackend::select(desc, host);

    let mut slots = Vec::with_capacity(devices.len());
    let mut slots_mb = 0;
    for device in devices {
        let id = match (device.dev_type.as_str(), &device.data.id) {
            ("dimm", Some(id)) => id,
            _ => return Err(MemoryError::UnsupportedDevice(device.dev_type.clone())),
        };
        let size_mb = device.data.size / BYTES_PER_MB;
        slots_mb += size_mb;
        slots.push(MemSlot {
            size_mb,
            mem_obj: backend.object(device.data.memdev_id(), size_mb),
            mem_dev: MemDevice {
                dev_type: "pc-dimm".to_owned(),
                id: id.clone(),
            },
        });
    }

    let base_mb = desc
        .mem
        .checked_sub(slots_mb)
        .filter(|base| *base > 0)
        .ok_or(MemoryError::WrongSize(desc.mem))?;
    let mut mem_desc = strategy.generate_mem_desc(base_mb, &backend);
    mem_desc.mem_slots = slots;
    desc.mem_desc = Some(mem_desc);
    Ok(())
}

/// Boot memory plus every slot must add up to the configured size.
pub fn check_mem_desc(desc: &GuestDesc) -> Result<(), MemoryError> {
    let Some(mem_desc) = &desc.mem_desc else {
        return Ok(());
    };
    let actual = mem_desc.total_mb();
    if mem_desc.size_mb == 0 || actual != desc.mem {
        return Err(MemoryError::Mismatch {
            uuid: desc.uuid().to_owned(),
            expected: desc.mem,
            actual,
        });
    }
    Ok(())
}
