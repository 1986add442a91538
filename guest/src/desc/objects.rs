use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

/// A QEMU `-object` backend: `{type},id={id},k=v,...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub obj_type: String,
    pub id: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Object {
    pub fn new(obj_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            obj_type: obj_type.into(),
            id: id.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

impl Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},id={}", self.obj_type, self.id)?;
        write_options(f, &self.options)
    }
}

/// A QEMU `-device` front end: `{driver},id={id},k=v,...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub driver: String,
    pub id: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Device {
    pub fn new(driver: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            id: id.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},id={}", self.driver, self.id)?;
        write_options(f, &self.options)
    }
}

/// A QEMU `-chardev` backend: `{backend},id={id},k=v,...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharDev {
    pub backend: String,
    pub id: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl CharDev {
    pub fn new(backend: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            id: id.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

impl Display for CharDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},id={}", self.backend, self.id)?;
        write_options(f, &self.options)
    }
}

fn write_options(f: &mut fmt::Formatter<'_>, options: &BTreeMap<String, String>) -> fmt::Result {
    for (key, value) in options {
        if value.is_empty() {
            write!(f, ",{key}")?;
        } else {
            write!(f, ",{key}={value}")?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Accel {
    #[serde(rename = "kvm")]
    Kvm,
    #[serde(rename = "tcg")]
    Tcg,
}

impl Display for Accel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Accel::Kvm => "kvm",
            Accel::Tcg => "tcg",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDesc {
    pub model: String,
    /// Feature toggles appended to the model, e.g. `+vmx` or `kvm=off`.
    #[serde(default)]
    pub features: Vec<String>,
    pub accel: Accel,
    pub cpus: u16,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub max_cpus: u32,
}

impl CpuDesc {
    pub fn cpu_arg(&self) -> String {
        let mut arg = self.model.clone();
        for feature in &self.features {
            arg.push(',');
            arg.push_str(feature);
        }
        arg
    }

    pub fn smp_arg(&self) -> String {
        format!(
            "cpus={},sockets={},cores={},threads={},maxcpus={}",
            self.cpus, self.sockets, self.cores, self.threads, self.max_cpus
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemDevice {
    #[serde(rename = "type")]
    pub dev_type: String,
    pub id: String,
}

/// One hot-plugged DIMM: its backend object plus the `pc-dimm` device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSlot {
    pub size_mb: u64,
    pub mem_obj: Object,
    pub mem_dev: MemDevice,
}

impl MemSlot {
    pub fn device_arg(&self) -> String {
        format!(
            "{},id={},memdev={}",
            self.mem_dev.dev_type, self.mem_dev.id, self.mem_obj.id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemDesc {
    /// Boot memory in MB, excluding hot-plugged slots.
    pub size_mb: u64,
    pub slots: u32,
    pub max_mem_mb: u64,
    pub mem: Object,
    #[serde(default)]
    pub mem_slots: Vec<MemSlot>,
}

impl MemDesc {
    pub fn total_mb(&self) -> u64 {
        self.size_mb + self.mem_slots.iter().map(|slot| slot.size_mb).sum::<u64>()
    }

    pub fn memory_arg(&self) -> String {
        if self.slots > 0 {
            format!(
                "{}M,slots={},maxmem={}M",
                self.size_mb, self.slots, self.max_mem_mb
            )
        } else {
            format!("{}M", self.size_mb)
        }
    }
}

/// Boot firmware image for UEFI guests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    /// Read-only code flash drive (x86 OVMF).
    Pflash(PathBuf),
    /// `-bios` image (aarch64 AAVMF).
    Bios(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDesc {
    pub machine_type: String,
    pub accel: Accel,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
}

impl MachineDesc {
    pub fn machine_arg(&self) -> String {
        let mut arg = format!("{},accel={}", self.machine_type, self.accel);
        for (key, value) in &self.options {
            arg.push_str(&format!(",{key}={value}"));
        }
        arg
    }
}

/// Guest agent channel: a UNIX socket chardev wired to a virtio serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QgaDesc {
    pub socket: CharDev,
    pub serial_bus: Device,
    pub port: Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvpanicDesc {
    pub device: Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsaSerialDesc {
    pub chardev: CharDev,
    pub device: Device,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_display_orders_options() {
        let obj = Object::new("memory-backend-file", "mem")
            .with("size", "1024M")
            .with("mem-path", "/dev/hugepages/u")
            .with("share", "on");
        assert_eq!(
            obj.to_string(),
            "memory-backend-file,id=mem,mem-path=/dev/hugepages/u,share=on,size=1024M"
        );
    }

    #[test]
    fn bare_option_flags() {
        let chardev = CharDev::new("socket", "hmqmondev")
            .with("host", "127.0.0.1")
            .with("port", "55903")
            .with("server", "")
            .with("nowait", "");
        assert_eq!(
            chardev.to_string(),
            "socket,id=hmqmondev,host=127.0.0.1,nowait,port=55903,server"
        );
    }

    #[test]
    fn memory_arg_without_slots() {
        let desc = MemDesc {
            size_mb: 2048,
            slots: 0,
            max_mem_mb: 2048,
            mem: Object::new("memory-backend-ram", "mem").with("size", "2048M"),
            mem_slots: Vec::new(),
        };
        assert_eq!(desc.memory_arg(), "2048M");
        assert_eq!(desc.total_mb(), 2048);
    }
}
