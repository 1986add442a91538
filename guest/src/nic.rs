use std::path::PathBuf;

use thiserror::Error;

use crate::{
    desc::{GuestNetwork, NicDriver},
    host::HostInfo,
    options::{BridgeDev, BridgeDriver},
    paths::GuestPaths,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NicError {
    #[error("Can't find bridge {0}")]
    BridgeNotFound(String),
}

/// Tap up/down hooks QEMU calls with the tap name as `$1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicScripts {
    pub up_path: PathBuf,
    pub up: String,
    pub down_path: PathBuf,
    pub down: String,
}

pub fn resolve_bridge(nic: &GuestNetwork, host: &dyn HostInfo) -> Result<BridgeDev, NicError> {
    host.bridge_dev(&nic.bridge)
        .ok_or_else(|| NicError::BridgeNotFound(nic.bridge.clone()))
}

/// Script paths for a NIC, or `None` for passthrough NICs which have no tap.
pub fn nic_script_paths(
    nic: &GuestNetwork,
    host: &dyn HostInfo,
    paths: &GuestPaths<'_>,
) -> Result<Option<(PathBuf, PathBuf)>, NicError> {
    if nic.driver == NicDriver::Vfio {
        return Ok(None);
    }
    let bridge = resolve_bridge(nic, host)?;
    Ok(Some((
        paths.nic_up_script(&bridge.device, &nic.ifname),
        paths.nic_down_script(&bridge.device, &nic.ifname),
    )))
}

pub fn generate_nic_scripts(
    nic: &GuestNetwork,
    host: &dyn HostInfo,
    paths: &GuestPaths<'_>,
) -> Result<Option<NicScripts>, NicError> {
    let Some((up_path, down_path)) = nic_script_paths(nic, host, paths)? else {
        return Ok(None);
    };
    let bridge = resolve_bridge(nic, host)?;
    let device = &bridge.device;

    let (up, down) = match bridge.driver {
        BridgeDriver::Linux => (
            format!(
                "#!/bin/bash\n\
                 ip link set dev \"$1\" master {device}\n\
                 ip link set dev \"$1\" up\n"
            ),
            format!(
                "#!/bin/bash\n\
                 ip link set dev \"$1\" nomaster 2>/dev/null || true\n\
                 ip link set dev \"$1\" down 2>/dev/null || true\n"
            ),
        ),
        BridgeDriver::Openvswitch => (
            format!(
                "#!/bin/bash\n\
                 ovs-vsctl --may-exist add-port {device} \"$1\"\n\
                 ip link set dev \"$1\" up\n"
            ),
            format!(
                "#!/bin/bash\n\
                 ovs-vsctl --if-exists del-port {device} \"$1\"\n"
            ),
        ),
    };

    Ok(Some(NicScripts {
        up_path,
        up,
        down_path,
        down,
    }))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use hostman_system::Arch;

    use super::*;
    use crate::host::testing;

    fn nic(bridge: &str) -> GuestNetwork {
        GuestNetwork {
            ifname: "vnet1".to_owned(),
            mac: "00:22:33:44:55:66".to_owned(),
            ip: "10.0.0.5".to_owned(),
            bridge: bridge.to_owned(),
            driver: NicDriver::Virtio,
            index: 0,
            bw: None,
        }
    }

    #[test]
    fn scripts_are_named_by_bridge_device() {
        let host = testing::host(Arch::X86_64);
        let paths = GuestPaths::new(Path::new("/srv/u"));
        let scripts = generate_nic_scripts(&nic("vpc"), &host, &paths)
            .unwrap()
            .unwrap();
        assert_eq!(scripts.up_path, PathBuf::from("/srv/u/if-up-brvpc-vnet1.sh"));
        assert_eq!(
            scripts.down_path,
            PathBuf::from("/srv/u/if-down-brvpc-vnet1.sh")
        );
        assert!(scripts.up.contains("ovs-vsctl --may-exist add-port brvpc \"$1\""));
        assert!(scripts.down.contains("--if-exists del-port brvpc"));
    }

    #[test]
    fn missing_bridge_is_fatal() {
        let host = testing::host(Arch::X86_64);
        let paths = GuestPaths::new(Path::new("/srv/u"));
        let err = generate_nic_scripts(&nic("nope"), &host, &paths).unwrap_err();
        assert_eq!(err.to_string(), "Can't find bridge nope");
    }

    #[test]
    fn vfio_nic_has_no_scripts() {
        let host = testing::host(Arch::X86_64);
        let paths = GuestPaths::new(Path::new("/srv/u"));
        let mut nic = nic("nope");
        nic.driver = NicDriver::Vfio;
        assert_eq!(generate_nic_scripts(&nic, &host, &paths).unwrap(), None);
    }
}
