//! Declarative description of a guest's hardware.
//!
//! The control plane produces a [`GuestDesc`] as JSON; the controller fills the derived
//! sub-descriptors (`cpu_desc`, `mem_desc`, ...) through the architecture strategy and
//! persists the result in the guest home directory.

mod metadata;
mod objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use hostman_system::CpuCount;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use self::metadata::{GuestMetadata, OsName, UsbControllerType};
pub use self::objects::{
    Accel, CharDev, CpuDesc, Device, Firmware, IsaSerialDesc, MachineDesc, MemDesc, MemDevice,
    MemSlot, Object, PvpanicDesc, QgaDesc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineType {
    #[serde(rename = "pc")]
    Pc,
    #[serde(rename = "q35")]
    Q35,
    #[serde(rename = "virt")]
    ArmVirt,
}

impl MachineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineType::Pc => "pc",
            MachineType::Q35 => "q35",
            MachineType::ArmVirt => "virt",
        }
    }

    pub fn is_pcie(&self) -> bool {
        matches!(self, MachineType::Q35 | MachineType::ArmVirt)
    }

    /// Root bus devices attach to when no controller is named.
    pub fn root_bus(&self) -> &'static str {
        if self.is_pcie() { "pcie.0" } else { "pci.0" }
    }
}

impl Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bios {
    #[default]
    #[serde(rename = "BIOS", alias = "bios", alias = "")]
    Legacy,
    #[serde(rename = "UEFI", alias = "uefi")]
    Uefi,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vdi {
    #[default]
    #[serde(rename = "vnc", alias = "")]
    Vnc,
    #[serde(rename = "spice")]
    Spice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorMode {
    #[serde(rename = "readline")]
    Readline,
    #[serde(rename = "control")]
    Control,
}

impl MonitorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorMode::Readline => "readline",
            MonitorMode::Control => "control",
        }
    }
}

/// Offset from the VNC display number to the HMP monitor TCP port.
pub const MONITOR_PORT_BASE: u16 = 55900;
/// Offset from the VNC display number to the QMP monitor TCP port.
pub const QMP_MONITOR_PORT_BASE: u16 = 56100;
/// SPICE listens on the regular VNC TCP port of the display.
pub const VNC_PORT_BASE: u16 = 5900;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub port: u16,
    pub mode: MonitorMode,
}

impl Monitor {
    pub fn hmp(vnc_port: u16) -> Self {
        Self {
            id: "hmqmon".to_owned(),
            port: vnc_port + MONITOR_PORT_BASE,
            mode: MonitorMode::Readline,
        }
    }

    pub fn qmp(vnc_port: u16) -> Self {
        Self {
            id: "qmqmon".to_owned(),
            port: vnc_port + QMP_MONITOR_PORT_BASE,
            mode: MonitorMode::Control,
        }
    }

    /// Id of the socket chardev backing this monitor.
    pub fn chardev_id(&self) -> String {
        format!("{}dev", self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NicDriver {
    #[default]
    #[serde(rename = "virtio")]
    Virtio,
    #[serde(rename = "e1000")]
    E1000,
    #[serde(rename = "vmxnet3")]
    Vmxnet3,
    #[serde(rename = "rtl8139")]
    Rtl8139,
    #[serde(rename = "vfio-pci")]
    Vfio,
}

impl NicDriver {
    /// QEMU device model for the NIC front end.
    pub fn device_model(&self) -> &'static str {
        match self {
            NicDriver::Virtio => "virtio-net-pci",
            NicDriver::E1000 => "e1000",
            NicDriver::Vmxnet3 => "vmxnet3",
            NicDriver::Rtl8139 => "rtl8139",
            NicDriver::Vfio => "vfio-pci",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNetwork {
    pub ifname: String,
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    pub bridge: String,
    #[serde(default)]
    pub driver: NicDriver,
    #[serde(default)]
    pub index: u16,
    /// Link speed in Mbps advertised to the guest, when the binary supports it.
    #[serde(default)]
    pub bw: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskDriver {
    #[default]
    #[serde(rename = "virtio")]
    Virtio,
    #[serde(rename = "scsi")]
    Scsi,
    #[serde(rename = "pvscsi")]
    Pvscsi,
    #[serde(rename = "ide")]
    Ide,
    #[serde(rename = "sata")]
    Sata,
}

fn default_disk_format() -> String {
    "qcow2".to_owned()
}

fn default_cache_mode() -> String {
    "none".to_owned()
}

fn default_aio_mode() -> String {
    "native".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDisk {
    pub index: u16,
    pub path: PathBuf,
    #[serde(default = "default_disk_format")]
    pub format: String,
    #[serde(default)]
    pub driver: DiskDriver,
    #[serde(default = "default_cache_mode")]
    pub cache_mode: String,
    #[serde(default = "default_aio_mode")]
    pub aio_mode: String,
    #[serde(default)]
    pub encrypt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolatedDevType {
    #[serde(rename = "GPU-HPC")]
    GpuHpc,
    #[serde(rename = "GPU-VGA")]
    GpuVga,
    #[serde(rename = "USB")]
    Usb,
    #[serde(rename = "NIC")]
    Nic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedDevice {
    /// PCI address (`0000:3b:00.0`) or, for USB, `bus:device`.
    pub addr: String,
    pub dev_type: IsolatedDevType,
    /// `vendor:device` identifier, e.g. `10de:1eb8`.
    #[serde(default)]
    pub vendor_device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PciControllerType {
    #[serde(rename = "pcie-root")]
    PcieRoot,
    #[serde(rename = "pci-root")]
    PciRoot,
    #[serde(rename = "pci-bridge")]
    PciBridge,
    #[serde(rename = "pcie-root-port")]
    PcieRootPort,
    #[serde(rename = "pcie-to-pci-bridge")]
    PcieToPciBridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciController {
    pub ctype: PciControllerType,
    pub id: String,
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub chassis: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbController {
    pub id: String,
}

impl Default for UsbController {
    fn default() -> Self {
        Self {
            id: "usb".to_owned(),
        }
    }
}

/// Free-form `-key value` option; arrays emit one flag per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraOption {
    One(String),
    Many(Vec<String>),
}

impl ExtraOption {
    pub fn values(&self) -> &[String] {
        match self {
            ExtraOption::One(value) => std::slice::from_ref(value),
            ExtraOption::Many(values) => values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDesc {
    uuid: String,
    #[serde(default)]
    pub name: String,
    pub cpu: CpuCount,
    /// Memory in MB.
    pub mem: u64,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        serialize_with = "none_as_empty"
    )]
    pub machine: Option<MachineType>,
    #[serde(default)]
    pub bios: Bios,
    #[serde(default)]
    pub vdi: Vdi,
    #[serde(default)]
    pub nics: Vec<GuestNetwork>,
    #[serde(default)]
    pub disks: Vec<GuestDisk>,
    #[serde(default)]
    pub isolated_devices: Vec<IsolatedDevice>,
    #[serde(default)]
    pub pci_controllers: Vec<PciController>,
    #[serde(default)]
    pub usb: UsbController,
    #[serde(default)]
    pub metadata: GuestMetadata,
    #[serde(default)]
    pub extra_options: BTreeMap<String, ExtraOption>,
    /// Set on the standby side of a guest with a live replica.
    #[serde(default)]
    pub is_slave: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmp_monitor: Option<Monitor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qmp_monitor: Option<Monitor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_migrate_dest_port: Option<u16>,
    #[serde(default)]
    pub live_migrate_use_tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_desc: Option<CpuDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_desc: Option<MemDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_desc: Option<MachineDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qga: Option<QgaDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvpanic: Option<PvpanicDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isa_serial: Option<IsaSerialDesc>,
}

impl GuestDesc {
    pub fn new(uuid: impl Into<String>, cpu: CpuCount, mem: u64) -> Self {
        Self {
            uuid: uuid.into(),
            name: String::new(),
            cpu,
            mem,
            machine: None,
            bios: Bios::default(),
            vdi: Vdi::default(),
            nics: Vec::new(),
            disks: Vec::new(),
            isolated_devices: Vec::new(),
            pci_controllers: Vec::new(),
            usb: UsbController::default(),
            metadata: GuestMetadata::default(),
            extra_options: BTreeMap::new(),
            is_slave: false,
            hmp_monitor: None,
            qmp_monitor: None,
            live_migrate_dest_port: None,
            live_migrate_use_tls: false,
            encrypt_key_path: None,
            cpu_desc: None,
            mem_desc: None,
            machine_desc: None,
            qga: None,
            pvpanic: None,
            isa_serial: None,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Machine type with the legacy PC default applied.
    pub fn machine_or_default(&self) -> MachineType {
        self.machine.unwrap_or(MachineType::Pc)
    }

    /// True when any passthrough device is not a USB device.
    pub fn has_gpu(&self) -> bool {
        self.isolated_devices
            .iter()
            .any(|dev| dev.dev_type != IsolatedDevType::Usb)
    }

    pub fn gpus_has_vga(&self) -> bool {
        self.isolated_devices
            .iter()
            .any(|dev| dev.dev_type == IsolatedDevType::GpuVga)
    }

    pub fn pci_initialized(&self) -> bool {
        !self.pci_controllers.is_empty()
    }

    /// First controller that accepts hot-plugged PCI devices.
    pub fn hot_plug_pci_controller(&self) -> Option<&PciController> {
        self.pci_controllers.iter().find(|ctrl| {
            matches!(
                ctrl.ctype,
                PciControllerType::PciRoot | PciControllerType::PciBridge
            )
        })
    }
}

impl FromStr for MachineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pc" => Ok(MachineType::Pc),
            "q35" => Ok(MachineType::Q35),
            "virt" => Ok(MachineType::ArmVirt),
            other => Err(format!("unknown machine type: {other}")),
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<MachineType>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => MachineType::from_str(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn none_as_empty<S>(value: &Option<MachineType>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(value.map(|m| m.as_str()).unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC_JSON: &str = r#"{
        "uuid": "5e6d1f37-90c5-4d3a-8c1e-2f0a4b6c8d10",
        "name": "web-1",
        "cpu": 4,
        "mem": 4096,
        "machine": "",
        "bios": "",
        "nics": [
            {"ifname": "vnet1", "mac": "00:22:33:44:55:66", "ip": "10.0.0.5", "bridge": "br0"}
        ],
        "metadata": {"os_name": "Linux", "disable_usb_kbd": "true", "provider_tag": "x"},
        "extra_options": {"global": ["kvm-pit.lost_tick_policy=delay", "ICH9-LPC.disable_s3=1"]}
    }"#;

    #[test]
    fn parse_control_plane_desc() {
        let desc: GuestDesc = serde_json::from_str(DESC_JSON).unwrap();
        assert_eq!(desc.uuid(), "5e6d1f37-90c5-4d3a-8c1e-2f0a4b6c8d10");
        assert_eq!(desc.machine, None);
        assert_eq!(desc.machine_or_default(), MachineType::Pc);
        assert_eq!(desc.bios, Bios::Legacy);
        assert_eq!(desc.vdi, Vdi::Vnc);
        assert_eq!(desc.nics[0].driver, NicDriver::Virtio);
        assert!(desc.metadata.disable_usb_kbd);
        assert_eq!(desc.metadata.extra.get("provider_tag").map(String::as_str), Some("x"));
        assert_eq!(desc.extra_options["global"].values().len(), 2);
    }

    #[test]
    fn desc_survives_persistence() {
        let desc: GuestDesc = serde_json::from_str(DESC_JSON).unwrap();
        let saved = serde_json::to_string(&desc).unwrap();
        let loaded: GuestDesc = serde_json::from_str(&saved).unwrap();
        assert_eq!(desc, loaded);
    }

    #[test]
    fn monitor_ports_follow_vnc_port() {
        assert_eq!(Monitor::hmp(3).port, 55903);
        assert_eq!(Monitor::qmp(3).port, 56103);
        assert_eq!(Monitor::qmp(3).chardev_id(), "qmqmondev");
    }

    #[test]
    fn hot_plug_controller_skips_root_ports() {
        let mut desc = GuestDesc::new("u", CpuCount::new(1), 512);
        desc.pci_controllers = vec![
            PciController {
                ctype: PciControllerType::PcieRootPort,
                id: "pcie.1".to_owned(),
                bus: None,
                chassis: None,
            },
            PciController {
                ctype: PciControllerType::PciBridge,
                id: "pci.1".to_owned(),
                bus: Some("pci.0".to_owned()),
                chassis: Some(1),
            },
        ];
        assert_eq!(desc.hot_plug_pci_controller().unwrap().id, "pci.1");
    }
}
