//! Turns a prepared guest descriptor into its start and stop scripts.
//!
//! Rendering is a pure function of the descriptor, the host view, and the runtime
//! overrides: rendering twice with the same inputs yields byte-identical scripts.

mod binary;
mod devices;
mod qemu;
mod script;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use self::binary::QemuBinary;
pub use self::qemu::QemuOptions;

use crate::{desc::GuestDesc, host::HostInfo, nic::NicError, paths::GuestPaths};

/// Id of the x509 credentials object used by TLS incoming migration.
pub const TLS_CREDS_ID: &str = "tls0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error(transparent)]
    Nic(#[from] NicError),

    #[error("guest {uuid} has no {what} descriptor")]
    Unprepared { uuid: String, what: &'static str },

    #[error("guest {uuid} is waiting for a migration but has no listen port")]
    MissingMigratePort { uuid: String },
}

/// Launch parameters that are not part of the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOverrides {
    /// VNC display number; monitor ports are derived from it.
    pub vnc_port: u16,
    pub qemu_version: Option<String>,
    /// Launch paused, waiting for an inbound live migration.
    pub need_migrate: bool,
    pub live_migrate_port: Option<u16>,
    pub live_migrate_use_tls: bool,
    /// Base64 secret unlocking encrypted disks.
    pub encrypt_key: Option<String>,
    /// Command line the migration source runs; the local one is unified onto it.
    pub src_qemu_cmdline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedScripts {
    pub start: String,
    pub stop: String,
}

/// Where an incoming launch reads guest state from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Incoming {
    Tcp { port: u16 },
    Defer { port: u16 },
    StateFile,
}

pub(crate) struct RenderContext<'a> {
    pub desc: &'a GuestDesc,
    pub host: &'a dyn HostInfo,
    pub overrides: &'a RuntimeOverrides,
    pub home: PathBuf,
}

impl<'a> RenderContext<'a> {
    pub fn new(desc: &'a GuestDesc, host: &'a dyn HostInfo, overrides: &'a RuntimeOverrides) -> Self {
        Self {
            desc,
            host,
            overrides,
            home: host.options().guest_home(desc.uuid()),
        }
    }

    pub fn paths(&self) -> GuestPaths<'_> {
        GuestPaths::new(&self.home)
    }

    /// Key file for encrypted disks: the override is saved under the guest home.
    pub fn encrypt_key_file(&self) -> Option<PathBuf> {
        if self.overrides.encrypt_key.is_some() {
            Some(self.paths().encrypt_key())
        } else {
            self.desc.encrypt_key_path.clone()
        }
    }

    pub fn use_tls(&self) -> bool {
        self.overrides.live_migrate_use_tls || self.desc.live_migrate_use_tls
    }

    /// Exactly one incoming form: a TCP listener when migrating, else a saved state file.
    pub fn incoming(&self) -> Result<Incoming, RenderError> {
        if !(self.overrides.need_migrate || self.desc.is_slave) {
            return Ok(Incoming::StateFile);
        }
        let port = self
            .overrides
            .live_migrate_port
            .or(self.desc.live_migrate_dest_port)
            .ok_or_else(|| RenderError::MissingMigratePort {
                uuid: self.desc.uuid().to_owned(),
            })?;
        if self.use_tls() {
            Ok(Incoming::Defer { port })
        } else {
            Ok(Incoming::Tcp { port })
        }
    }

    fn unprepared(&self, what: &'static str) -> RenderError {
        RenderError::Unprepared {
            uuid: self.desc.uuid().to_owned(),
            what,
        }
    }
}

pub fn render(
    desc: &GuestDesc,
    host: &dyn HostInfo,
    overrides: &RuntimeOverrides,
) -> Result<RenderedScripts, RenderError> {
    let ctx = RenderContext::new(desc, host, overrides);
    let options = devices::qemu_options(&ctx)?;
    let start = script::start_script(&ctx, &options)?;
    let stop = script::stop_script(&ctx)?;
    debug!(uuid = %desc.uuid(), "rendered qemu options: {}", options.to_script());
    Ok(RenderedScripts { start, stop })
}

/// The QEMU options alone, without the surrounding script.
pub fn render_options(
    desc: &GuestDesc,
    host: &dyn HostInfo,
    overrides: &RuntimeOverrides,
) -> Result<QemuOptions, RenderError> {
    devices::qemu_options(&RenderContext::new(desc, host, overrides))
}


#[cfg(test)]
mod tests {
    use hostman_system::Arch;

    use super::*;
    use crate::{
        desc::{MachineType, OsName},
        host::testing as host_testing,
    };

    fn overrides() -> RuntimeOverrides {
        RuntimeOverrides {
            vnc_port: 3,
            ..Default::default()
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        for (arch, machine) in [
            (Arch::X86_64, None),
            (Arch::X86_64, Some(MachineType::Q35)),
            (Arch::Aarch64, None),
        ] {
            let host = host_testing::host(arch);
            let mut desc = testing::desc();
            desc.machine = machine;
            let desc = testing::prepare(desc, &host);
            let first = render(&desc, &host, &overrides()).unwrap();
            let second = render(&desc, &host, &overrides()).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn unprepared_desc_is_rejected() {
        let host = host_testing::host(Arch::X86_64);
        let err = render(&testing::desc(), &host, &overrides()).unwrap_err();
        assert!(matches!(err, RenderError::Unprepared { what: "machine", .. }));
    }

    #[test]
    fn missing_bridge_aborts_render() {
        let host = host_testing::host(Arch::X86_64);
        let mut desc = testing::desc();
        desc.nics[0].bridge = "br9".to_owned();
        let desc = testing::prepare(desc, &host);
        let err = render(&desc, &host, &overrides()).unwrap_err();
        assert_eq!(err.to_string(), "Can't find bridge br9");
    }

    #[test]
    fn android_gets_mouse_not_tablet() {
        let host = host_testing::host(Arch::X86_64);
        let mut desc = testing::desc();
        desc.metadata.os_name = OsName::Android;
        let desc = testing::prepare(desc, &host);
        let args = render_options(&desc, &host, &overrides()).unwrap().to_args();
        assert!(args.iter().any(|arg| arg.starts_with("usb-mouse,")));
        assert!(!args.iter().any(|arg| arg.starts_with("usb-tablet,")));
    }

    #[test]
    fn migration_without_port_fails() {
        let host = host_testing::host(Arch::X86_64);
        let desc = testing::prepare(testing::desc(), &host);
        let overrides = RuntimeOverrides {
            need_migrate: true,
            ..overrides()
        };
        assert!(matches!(
            render(&desc, &host, &overrides),
            Err(RenderError::MissingMigratePort { .. })
        ));
    }
}
