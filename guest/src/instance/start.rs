use std::time::Duration;

use hostman_cmd::{Command, CommandError};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{GuestInstance, GuestState, MemoryError, check_mem_desc};
use crate::{
    arch::ArchStrategyError,
    cmdline::{self, CmdlineError, split_words},
    desc::Monitor,
    fs::{self, FsError},
    launcher::{LaunchError, spawn_detached},
    monitor::{MonitorError, QmpClient},
    nic::{NicError, generate_nic_scripts},
    render::{Incoming, RenderContext, RenderError, RuntimeOverrides, TLS_CREDS_ID},
};

const SCRIPT_MODE: u32 = 0o755;
const KEY_MODE: u32 = 0o600;
const QMP_CONNECT_ATTEMPTS: u32 = 20;
const QMP_CONNECT_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum InstanceStartError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Arch(#[from] ArchStrategyError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Nic(#[from] NicError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Cmdline(#[from] CmdlineError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("failed to save guest descriptor")]
    Save(#[source] Box<super::InstanceError>),

    #[error("guest {uuid} is already running with pid {pid}")]
    AlreadyRunning { uuid: String, pid: Pid },
}

/// A launched guest and its background address announcements.
#[derive(Debug)]
pub struct Started {
    pub pid: Pid,
    /// Gratuitous ARP rounds; dropping the runtime before this finishes cuts them short.
    pub arp: JoinHandle<()>,
}

impl GuestInstance {
    /// Writes the scripts, launches QEMU detached, and records its PID.
    ///
    /// Returns once the process exists; the guest's boot is not awaited.
    #[tracing::instrument(skip_all, fields(uuid = %self.uuid()))]
    pub async fn start(
        &mut self,
        overrides: &RuntimeOverrides,
    ) -> Result<Started, InstanceStartError> {
        if let Some(pid) = self.pid().await?.filter(|pid| super::is_pid_alive(*pid)) {
            return Err(InstanceStartError::AlreadyRunning {
                uuid: self.uuid().to_owned(),
                pid,
            });
        }

        self.state = GuestState::Starting;
        match self.launch(overrides).await {
            Ok(pid) => {
                self.state = GuestState::Running;
                self.migrating.destination = overrides.need_migrate || self.desc.is_slave;
                info!(%pid, "guest started");
                self.start_memclean(pid).await;
                let arp = self.presend_arp();
                Ok(Started { pid, arp })
            }
            Err(err) => {
                self.state = GuestState::NotStarted;
                Err(err)
            }
        }
    }

    async fn launch(&mut self, overrides: &RuntimeOverrides) -> Result<Pid, InstanceStartError> {
        self.prepare()?;
        check_mem_desc(&self.desc)?;
        self.desc.hmp_monitor = Some(Monitor::hmp(overrides.vnc_port));
        self.desc.qmp_monitor = Some(Monitor::qmp(overrides.vnc_port));

        let paths = self.paths();
        fs::create_dir(paths.home_dir()).await?;

        if let Some(key) = &overrides.encrypt_key {
            fs::write_file_with_mode(paths.encrypt_key(), key.as_bytes(), KEY_MODE).await?;
        }
        self.write_nic_scripts().await?;

        let scripts = self.render(overrides)?;
        fs::write_file_with_mode(paths.start_script(), scripts.start.as_bytes(), SCRIPT_MODE)
            .await?;
        fs::write_file_with_mode(paths.stop_script(), scripts.stop.as_bytes(), SCRIPT_MODE).await?;
        self.save()
            .await
            .map_err(|err| InstanceStartError::Save(Box::new(err)))?;

        let output = Command::bash(paths.start_script())
            .current_dir(paths.home_dir())
            .run_to_string()
            .await?;
        let command = output
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default();
        debug!("launch command: {command}");
        let argv = match overrides.src_qemu_cmdline.as_deref() {
            Some(source) if overrides.need_migrate || self.desc.is_slave => {
                let unified = cmdline::unify(command, source)?;
                info!("unified launch command with migration source");
                debug!("unified command: {unified}");
                split_words(&unified)?
            }
            _ => split_words(command)?,
        };

        let pid = spawn_detached(&argv, &paths.log_file(), paths.home_dir()).await?;
        fs::write_file(paths.pid_file(), format!("{pid}\n").as_bytes()).await?;
        fs::write_file(
            paths.vnc_file(),
            format!("{}\n", overrides.vnc_port).as_bytes(),
        )
        .await?;

        let incoming = RenderContext::new(&self.desc, self.host.as_ref(), overrides).incoming()?;
        if let Incoming::Defer { port } = incoming {
            self.listen_tls_incoming(port).await?;
        }
        Ok(pid)
    }

    /// Up/down scripts for every tap NIC, rewritten on each start.
    pub async fn write_nic_scripts(&self) -> Result<(), InstanceStartError> {
        let paths = self.paths();
        for nic in &self.desc.nics {
            let Some(scripts) = generate_nic_scripts(nic, self.host.as_ref(), &paths)? else {
                continue;
            };
            fs::write_file_with_mode(&scripts.up_path, scripts.up.as_bytes(), SCRIPT_MODE).await?;
            fs::write_file_with_mode(&scripts.down_path, scripts.down.as_bytes(), SCRIPT_MODE)
                .await?;
        }
        Ok(())
    }

    async fn listen_tls_incoming(&self, port: u16) -> Result<(), InstanceStartError> {
        let Some(monitor) = self.desc.qmp_monitor.clone() else {
            return Ok(());
        };
        let mut attempt = 0;
        let mut qmp = loop {
            attempt += 1;
            match QmpClient::connect(monitor.port).await {
                Ok(qmp) => break qmp,
                Err(err) if attempt < QMP_CONNECT_ATTEMPTS => {
                    debug!(attempt, "qmp not ready: {err}");
                    tokio::time::sleep(QMP_CONNECT_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        qmp.migrate_set_tls_creds(TLS_CREDS_ID).await?;
        qmp.migrate_incoming(&format!("tcp:0:{port}")).await?;
        info!(port, "listening for tls migration");
        Ok(())
    }

    async fn start_memclean(&self, pid: Pid) {
        if !self.desc.metadata.enable_memclean {
            return;
        }
        let Some(binary) = &self.host.options().binary_memclean_path else {
            return;
        };
        let mem_bytes = self.desc.mem * 1024 * 1024;
        let result = Command::new(binary)
            .arg("--pid")
            .arg(pid.to_string())
            .arg("--mem-size")
            .arg(mem_bytes.to_string())
            .arg("--log-dir")
            .arg(self.paths().memclean_log_dir())
            .run()
            .await;
        if let Err(err) = result {
            error!("failed to start memclean: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::fs::PermissionsExt, path::Path, sync::Arc};

    use hostman_system::Arch;

    use super::*;
    use crate::{
        host::{Host, testing as host_testing},
        instance::testing,
        render::testing as render_testing,
    };

    const FAKE_QEMU: &str = "fake";
    const MIGRATE_PORT: u16 = 4401;

    /// Host whose only QEMU build records its argv in `root/argv` and exits.
    fn host_with_fake_qemu(root: &Path) -> Arc<Host> {
        let binary = root.join("qemu-fake");
        std::fs::write(
            &binary,
            format!(
                "#!/bin/sh\ncase \"$*\" in *help*) exit 0 ;; esac\nprintf '%s\\n' \"$@\" > {}\n",
                root.join("argv").display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut options = host_testing::options();
        options.servers_path = root.join("servers");
        options.hugepages_path = root.join("hugepages");
        options.qemu_binaries.insert(FAKE_QEMU.to_owned(), binary);
        Arc::new(Host::new(host_testing::caps(Arch::X86_64), options))
    }

    fn migrate_overrides(src_qemu_cmdline: &str) -> RuntimeOverrides {
        RuntimeOverrides {
            vnc_port: 7,
            qemu_version: Some(FAKE_QEMU.to_owned()),
            need_migrate: true,
            live_migrate_port: Some(MIGRATE_PORT),
            src_qemu_cmdline: Some(src_qemu_cmdline.to_owned()),
            ..Default::default()
        }
    }

    async fn recorded_argv(root: &Path) -> Vec<String> {
        let path = root.join("argv");
        for _ in 0..100 {
            if let Ok(argv) = std::fs::read_to_string(&path) {
                if argv.ends_with('\n') {
                    return argv.lines().map(str::to_owned).collect();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("fake qemu never ran");
    }

    #[tokio::test]
    async fn migrate_start_launches_unified_cmdline() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_with_fake_qemu(dir.path());
        let mut instance = GuestInstance::new(render_testing::desc(), host);
        let source = "/opt/qemu/bin/qemu-system-x86_64 -name web-1 -m 2048M \
            -device virtio-rng-pci,id=rng0 -vnc :1 -incoming tcp:0:9999";

        let started = instance.start(&migrate_overrides(source)).await.unwrap();
        assert!(!started.arp.is_finished());
        assert_eq!(instance.state(), GuestState::Running);
        assert!(instance.migrating().destination);

        let argv = recorded_argv(dir.path()).await;
        let has = |key: &str, value: &str| {
            argv.windows(2).any(|pair| pair[0] == key && pair[1] == value)
        };
        assert!(has("-device", "virtio-rng-pci,id=rng0"));
        assert!(has("-incoming", &format!("tcp:0:{MIGRATE_PORT}")));
        assert!(has("-vnc", ":7"));
        assert!(!argv.iter().any(|arg| arg == "tcp:0:9999"));
        assert!(!argv.iter().any(|arg| arg == ":1"));

        // Announcements keep running after start returns and finish on their own.
        started.arp.await.unwrap();
    }

    #[tokio::test]
    async fn unparsable_source_cmdline_aborts_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_with_fake_qemu(dir.path());
        let mut instance = GuestInstance::new(render_testing::desc(), host);
        let source = "/opt/qemu/bin/qemu-system-x86_64 -name 'web-1 -device virtio-rng-pci";

        let err = instance.start(&migrate_overrides(source)).await.unwrap_err();
        assert!(matches!(
            err,
            InstanceStartError::Cmdline(CmdlineError::UnterminatedQuote)
        ));
        assert_eq!(instance.state(), GuestState::NotStarted);
        assert!(!instance.paths().pid_file().exists());
        assert!(!dir.path().join("argv").exists());
    }

    #[tokio::test]
    async fn nic_scripts_are_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let instance = GuestInstance::new(render_testing::desc(), host);
        fs::create_dir(instance.home_dir()).await.unwrap();
        instance.write_nic_scripts().await.unwrap();

        let up = instance.paths().nic_up_script("br0", "vnet1");
        let mode = std::fs::metadata(&up).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let up = std::fs::read_to_string(up).unwrap();
        assert!(up.contains("ip link set dev \"$1\" master br0"));
    }

    #[tokio::test]
    async fn missing_bridge_fails_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let mut desc = render_testing::desc();
        desc.nics[0].bridge = "br9".to_owned();
        let mut instance = GuestInstance::new(desc, host);

        let err = instance.start(&RuntimeOverrides::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "Can't find bridge br9");
        assert_eq!(instance.state(), GuestState::NotStarted);
        assert!(!instance.paths().pid_file().exists());
        assert!(!instance.paths().start_script().exists());
    }

    #[tokio::test]
    async fn encrypt_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let mut desc = render_testing::desc();
        desc.nics[0].bridge = "br9".to_owned();
        let mut instance = GuestInstance::new(desc, host);
        let overrides = RuntimeOverrides {
            encrypt_key: Some("c2VjcmV0".to_owned()),
            ..Default::default()
        };

        // The key lands before NIC resolution aborts the start.
        instance.start(&overrides).await.unwrap_err();
        let key = instance.paths().encrypt_key();
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "c2VjcmV0");
        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
