//! Per-guest lifecycle controller.
//!
//! A [`GuestInstance`] owns one guest home directory. Callers serialize lifecycle
//! operations per guest; the controller itself holds no locks.

mod memory;
mod start;
mod stop;

use std::{path::PathBuf, sync::Arc};

use nix::{
    errno::Errno,
    sys::signal::kill,
    unistd::Pid,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use self::memory::{MemoryError, check_mem_desc, init_mem_desc_from_memory_info};
pub use self::start::{InstanceStartError, Started};

use crate::{
    arch::{ArchStrategy, ArchStrategyError, MemBackend, accel_for, fix_guest_machine_type, strategy_for},
    arp,
    certs::{self, CertsError, MigrateCerts},
    desc::{GuestDesc, Monitor},
    fs::{self, FsError},
    host::HostInfo,
    monitor::{MonitorError, QmpClient, VmStatus},
    paths::GuestPaths,
    render::{self, RenderError, RenderedScripts, RuntimeOverrides},
};

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("invalid guest descriptor {path}")]
    Desc {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Arch(#[from] ArchStrategyError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Certs(#[from] CertsError),

    #[error("guest {uuid} is not running")]
    NotRunning { uuid: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Live-migration roles a running guest may hold alongside its normal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Migrating {
    pub source: bool,
    pub destination: bool,
}

/// What `status` observed about a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestStatus {
    pub uuid: String,
    pub state: GuestState,
    pub pid: Option<i32>,
    pub vnc_port: Option<u16>,
    /// QEMU run state, when the QMP monitor answered.
    pub run_state: Option<String>,
}

/// Coerces machine and firmware and fills every derived descriptor still missing.
///
/// Existing sub-descriptors are kept, so memory slots recorded by a resync survive.
pub fn prepare_desc(desc: &mut GuestDesc, host: &dyn HostInfo) -> Result<(), ArchStrategyError> {
    fix_guest_machine_type(desc, host.arch());
    let strategy = strategy_for(host.arch());
    let home = host.options().guest_home(desc.uuid());

    if desc.cpu_desc.is_none() {
        desc.cpu_desc = Some(strategy.generate_cpu_desc(desc.cpu, desc, host)?);
    }
    if desc.mem_desc.is_none() {
        let backend = MemBackend::select(desc, host);
        desc.mem_desc = Some(strategy.generate_mem_desc(desc.mem, &backend));
    }
    if desc.machine_desc.is_none() {
        desc.machine_desc = Some(strategy.generate_machine_desc(desc, accel_for(host), host));
    }
    if desc.qga.is_none() {
        desc.qga = Some(strategy.generate_qga_desc(&GuestPaths::new(&home).qga_socket()));
    }
    if desc.pvpanic.is_none() {
        desc.pvpanic = Some(strategy.generate_pvpanic_desc());
    }
    if desc.isa_serial.is_none() {
        desc.isa_serial = strategy.generate_isa_serial_desc();
    }
    Ok(())
}

/// True while a process with `pid` exists, even one owned by another user.
pub fn is_pid_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub struct GuestInstance {
    desc: GuestDesc,
    host: Arc<dyn HostInfo>,
    strategy: Box<dyn ArchStrategy>,
    home: PathBuf,
    state: GuestState,
    migrating: Migrating,
}

impl GuestInstance {
    pub fn new(desc: GuestDesc, host: Arc<dyn HostInfo>) -> Self {
        let home = host.options().guest_home(desc.uuid());
        let strategy = strategy_for(host.arch());
        Self {
            desc,
            host,
            strategy,
            home,
            state: GuestState::NotStarted,
            migrating: Migrating::default(),
        }
    }

    /// Reads `desc.json` from the guest home under `servers_path`.
    pub async fn load(uuid: &str, host: Arc<dyn HostInfo>) -> Result<Self, InstanceError> {
        let path = GuestPaths::new(&host.options().guest_home(uuid)).desc();
        let data = fs::read_file_to_string(&path).await?;
        let desc: GuestDesc =
            serde_json::from_str(&data).map_err(|source| InstanceError::Desc { path, source })?;
        Ok(Self::new(desc, host))
    }

    pub async fn save(&self) -> Result<(), InstanceError> {
        let path = self.paths().desc();
        let data = serde_json::to_vec_pretty(&self.desc).map_err(|source| InstanceError::Desc {
            path: path.clone(),
            source,
        })?;
        fs::create_dir(&self.home).await?;
        fs::write_file(&path, &data).await?;
        debug!(path = %path.display(), "saved guest descriptor");
        Ok(())
    }

    pub fn desc(&self) -> &GuestDesc {
        &self.desc
    }

    pub fn desc_mut(&mut self) -> &mut GuestDesc {
        &mut self.desc
    }

    pub fn uuid(&self) -> &str {
        self.desc.uuid()
    }

    pub fn home_dir(&self) -> &PathBuf {
        &self.home
    }

    pub fn paths(&self) -> GuestPaths<'_> {
        GuestPaths::new(&self.home)
    }

    pub fn state(&self) -> GuestState {
        self.state
    }

    pub fn migrating(&self) -> Migrating {
        self.migrating
    }

    pub fn prepare(&mut self) -> Result<(), ArchStrategyError> {
        prepare_desc(&mut self.desc, self.host.as_ref())
    }

    pub fn render(&self, overrides: &RuntimeOverrides) -> Result<RenderedScripts, RenderError> {
        render::render(&self.desc, self.host.as_ref(), overrides)
    }

    /// PID recorded by the last start, if its file exists and parses.
    pub async fn pid(&self) -> Result<Option<Pid>, FsError> {
        let path = self.paths().pid_file();
        if !fs::path_exists(&path).await? {
            return Ok(None);
        }
        let pid = fs::read_file_to_string(&path).await?;
        Ok(pid.trim().parse::<i32>().ok().map(Pid::from_raw))
    }

    pub async fn vnc_port(&self) -> Result<Option<u16>, FsError> {
        let path = self.paths().vnc_file();
        if !fs::path_exists(&path).await? {
            return Ok(None);
        }
        let port = fs::read_file_to_string(&path).await?;
        Ok(port.trim().parse().ok())
    }

    pub async fn is_running(&self) -> Result<bool, FsError> {
        Ok(self.pid().await?.is_some_and(is_pid_alive))
    }

    async fn qmp(&self) -> Result<QmpClient, InstanceError> {
        let vnc_port = self.vnc_port().await?.ok_or_else(|| InstanceError::NotRunning {
            uuid: self.uuid().to_owned(),
        })?;
        let monitor = self.desc.qmp_monitor.clone().unwrap_or_else(|| Monitor::qmp(vnc_port));
        Ok(QmpClient::connect(monitor.port).await?)
    }

    /// Observes the guest: a live PID means running, and QMP adds QEMU's own run state.
    pub async fn status(&self) -> Result<GuestStatus, InstanceError> {
        let pid = self.pid().await?;
        let vnc_port = self.vnc_port().await?;
        let alive = pid.is_some_and(is_pid_alive);

        let state = match (alive, self.state) {
            (true, GuestState::Stopping) => GuestState::Stopping,
            (true, _) => GuestState::Running,
            (false, GuestState::Starting) => GuestState::Starting,
            (false, GuestState::NotStarted) if pid.is_none() => GuestState::NotStarted,
            (false, _) => GuestState::Stopped,
        };

        let run_state = if alive {
            match self.query_status().await {
                Ok(status) => Some(status.status),
                Err(err) => {
                    debug!(uuid = %self.uuid(), "qmp status query failed: {err}");
                    None
                }
            }
        } else {
            None
        };

        Ok(GuestStatus {
            uuid: self.uuid().to_owned(),
            state,
            pid: pid.map(Pid::as_raw),
            vnc_port,
            run_state,
        })
    }

    pub async fn query_status(&self) -> Result<VmStatus, InstanceError> {
        Ok(self.qmp().await?.query_status().await?)
    }

    /// Rebuilds memory slots from the running QEMU after an agent restart, then saves.
    #[tracing::instrument(skip_all, fields(uuid = %self.uuid()))]
    pub async fn resync_memory(&mut self) -> Result<(), InstanceError> {
        let devices = self.qmp().await?.query_memory_devices().await?;
        init_mem_desc_from_memory_info(
            &mut self.desc,
            &devices,
            self.strategy.as_ref(),
            self.host.as_ref(),
        )?;
        check_mem_desc(&self.desc)?;
        info!(slots = devices.len(), "resynced memory devices");
        self.save().await
    }

    /// Handing out the PKI bundle means another host is about to pull this guest.
    pub async fn prepare_migrate_certs(&mut self) -> Result<MigrateCerts, InstanceError> {
        let certs = certs::prepare_migrate_certs(&self.paths().pki_dir()).await?;
        self.migrating.source = true;
        Ok(certs)
    }

    pub async fn write_migrate_certs(&self, certs: &MigrateCerts) -> Result<(), InstanceError> {
        Ok(certs::write_migrate_certs(&self.paths().pki_dir(), certs).await?)
    }

    /// Announces every NIC in the background; the handle need not be awaited.
    pub fn presend_arp(&self) -> JoinHandle<()> {
        arp::presend_arp(self.desc.nics.clone())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use hostman_system::Arch;

    use crate::host::{Host, testing as host_testing};

    /// Host whose guest homes live under `root`.
    pub fn host_at(arch: Arch, root: &std::path::Path) -> Arc<Host> {
        let mut options = host_testing::options();
        options.servers_path = root.join("servers");
        options.hugepages_path = root.join("hugepages");
        Arc::new(Host::new(host_testing::caps(arch), options))
    }
}

#[cfg(test)]
mod tests {
    use hostman_system::{Arch, CpuCount};

    use super::*;
    use crate::{
        desc::{Bios, MachineType},
        host::testing as host_testing,
        render::testing as render_testing,
    };

    #[test]
    fn prepare_on_aarch64_coerces_machine() {
        let host = host_testing::host(Arch::Aarch64);
        let mut desc = GuestDesc::new("uuid-arm", CpuCount::new(4), 2048);
        prepare_desc(&mut desc, &host).unwrap();
        assert_eq!(desc.machine, Some(MachineType::ArmVirt));
        assert_eq!(desc.bios, Bios::Uefi);
        assert_eq!(desc.machine_desc.as_ref().unwrap().machine_type, "virt");
        assert!(desc.isa_serial.is_none());
        assert_eq!(desc.cpu_desc.as_ref().unwrap().max_cpus, 512);
    }

    #[test]
    fn prepare_keeps_existing_memory_slots() {
        let host = host_testing::host(Arch::X86_64);
        let mut desc = GuestDesc::new("uuid-x86", CpuCount::new(2), 4096);
        prepare_desc(&mut desc, &host).unwrap();
        desc.mem_desc.as_mut().unwrap().size_mb = 3072;
        prepare_desc(&mut desc, &host).unwrap();
        assert_eq!(desc.mem_desc.as_ref().unwrap().size_mb, 3072);
    }

    #[test]
    fn pid_liveness() {
        assert!(is_pid_alive(Pid::this()));
        assert!(!is_pid_alive(Pid::from_raw(i32::MAX)));
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let mut instance = GuestInstance::new(render_testing::desc(), host.clone());
        instance.prepare().unwrap();
        instance.save().await.unwrap();

        let loaded = GuestInstance::load(render_testing::UUID, host).await.unwrap();
        assert_eq!(loaded.desc(), instance.desc());
        assert_eq!(loaded.home_dir(), &dir.path().join("servers").join(render_testing::UUID));
    }

    #[tokio::test]
    async fn status_of_never_started_guest() {
        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let instance = GuestInstance::new(render_testing::desc(), host);
        let status = instance.status().await.unwrap();
        assert_eq!(status.state, GuestState::NotStarted);
        assert_eq!(status.pid, None);
        assert_eq!(status.run_state, None);
    }

    #[tokio::test]
    async fn preparing_certs_marks_migration_source() {
        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let mut instance = GuestInstance::new(render_testing::desc(), host);
        let bundle: MigrateCerts = certs::CERT_FILES
            .iter()
            .map(|name| (name.to_string(), format!("-----BEGIN {name}-----\n")))
            .collect();
        instance.write_migrate_certs(&bundle).await.unwrap();
        assert_eq!(instance.migrating(), Migrating::default());

        let prepared = instance.prepare_migrate_certs().await.unwrap();
        assert_eq!(prepared, bundle);
        assert!(instance.migrating().source);
        assert!(!instance.migrating().destination);
    }
}
