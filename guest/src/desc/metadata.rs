use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Guest operating system family, compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum OsName {
    #[default]
    Linux,
    Windows,
    MacOs,
    Android,
    Vmware,
    Cirros,
    OpenWrt,
    Other(String),
}

impl Display for OsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsName::Linux => "Linux",
            OsName::Windows => "Windows",
            OsName::MacOs => "macOS",
            OsName::Android => "Android",
            OsName::Vmware => "VMWare",
            OsName::Cirros => "Cirros",
            OsName::OpenWrt => "OpenWrt",
            OsName::Other(name) => name,
        };
        f.write_str(name)
    }
}

impl FromStr for OsName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "" | "linux" => OsName::Linux,
            "windows" => OsName::Windows,
            "macos" => OsName::MacOs,
            "android" => OsName::Android,
            "vmware" => OsName::Vmware,
            "cirros" => OsName::Cirros,
            "openwrt" => OsName::OpenWrt,
            _ => OsName::Other(s.to_owned()),
        })
    }
}

impl Serialize for OsName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OsName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let Ok(name) = OsName::from_str(&s);
        Ok(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsbControllerType {
    #[default]
    #[serde(rename = "qemu-xhci", alias = "")]
    QemuXhci,
    #[serde(rename = "usb-ehci")]
    UsbEhci,
}

impl UsbControllerType {
    pub fn device_model(&self) -> &'static str {
        match self {
            UsbControllerType::QemuXhci => "qemu-xhci",
            UsbControllerType::UsbEhci => "usb-ehci",
        }
    }
}

/// Per-guest switches the control plane sends as a string map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestMetadata {
    #[serde(default)]
    pub os_name: OsName,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_distribution: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(default, with = "flag", skip_serializing_if = "is_false")]
    pub disable_usb_kbd: bool,
    #[serde(
        default,
        rename = "__pcie_extend_bus",
        with = "flag",
        skip_serializing_if = "is_false"
    )]
    pub pcie_extend_bus: bool,
    #[serde(default)]
    pub usb_controller_type: UsbControllerType,
    #[serde(default, with = "flag", skip_serializing_if = "is_false")]
    pub enable_memclean: bool,
    #[serde(default, with = "flag", skip_serializing_if = "is_false")]
    pub disable_isa_serial: bool,
    #[serde(default, with = "flag", skip_serializing_if = "is_false")]
    pub disable_pvpanic: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl GuestMetadata {
    /// Windows XP and Server 2003 report a `5.x` kernel version.
    pub fn is_old_windows(&self) -> bool {
        self.os_name == OsName::Windows && self.os_version.starts_with("5.")
    }

    pub fn is_windows_10(&self) -> bool {
        self.os_distribution.to_lowercase().contains("windows 10")
    }

    pub fn distribution_is(&self, name: OsName) -> bool {
        let Ok(distribution) = OsName::from_str(&self.os_distribution);
        !self.os_distribution.is_empty() && distribution == name
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
    }

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bool(value) => value,
            Raw::Str(value) => value == "true",
        })
    }
}
