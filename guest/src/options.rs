use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeDriver {
    #[default]
    Linux,
    Openvswitch,
}

/// Host-side device a guest bridge name resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeDev {
    /// Bridge device on the host, e.g. `br0`.
    pub device: String,
    #[serde(default)]
    pub driver: BridgeDriver,
}

fn default_servers_path() -> PathBuf {
    PathBuf::from("/opt/cloud/workspace/servers")
}

fn default_hugepages_path() -> PathBuf {
    PathBuf::from("/dev/hugepages")
}

fn default_true() -> bool {
    true
}

fn default_ovn_encap_cost() -> u32 {
    58
}

/// Host agent configuration shared by every guest on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    #[serde(default = "default_servers_path")]
    pub servers_path: PathBuf,
    #[serde(default = "default_hugepages_path")]
    pub hugepages_path: PathBuf,
    pub default_qemu_version: Option<String>,
    /// Installed QEMU builds by version.
    pub qemu_binaries: BTreeMap<String, PathBuf>,
    pub disable_kvm: bool,
    #[serde(default = "default_true")]
    pub enable_vm_uuid: bool,
    pub ovmf_path: Option<PathBuf>,
    pub set_vnc_password: bool,
    pub enable_qemu_debug_log: bool,
    pub binary_memclean_path: Option<PathBuf>,
    #[serde(default = "default_ovn_encap_cost")]
    pub ovn_encap_cost: u32,
    pub bridges: BTreeMap<String, BridgeDev>,
    /// Overrides for the per-machine vCPU ceiling.
    pub machine_cpu_max: BTreeMap<String, u32>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            servers_path: default_servers_path(),
            hugepages_path: default_hugepages_path(),
            default_qemu_version: None,
            qemu_binaries: BTreeMap::new(),
            disable_kvm: false,
            enable_vm_uuid: true,
            ovmf_path: None,
            set_vnc_password: false,
            enable_qemu_debug_log: false,
            binary_memclean_path: None,
            ovn_encap_cost: default_ovn_encap_cost(),
            bridges: BTreeMap::new(),
            machine_cpu_max: BTreeMap::new(),
        }
    }
}

impl HostOptions {
    pub fn guest_home(&self, uuid: &str) -> PathBuf {
        self.servers_path.join(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_document() {
        let options: HostOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, HostOptions::default());
        assert!(options.enable_vm_uuid);
        assert_eq!(options.ovn_encap_cost, 58);
        assert_eq!(
            options.guest_home("abc"),
            PathBuf::from("/opt/cloud/workspace/servers/abc")
        );
    }

    #[test]
    fn bridge_driver_names() {
        let options: HostOptions = serde_json::from_str(
            r#"{"bridges": {"br0": {"device": "br0"}, "ovs": {"device": "brvpc", "driver": "openvswitch"}}}"#,
        )
        .unwrap();
        assert_eq!(options.bridges["br0"].driver, BridgeDriver::Linux);
        assert_eq!(options.bridges["ovs"].driver, BridgeDriver::Openvswitch);
    }
}
