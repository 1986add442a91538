use std::time::Duration;

use hostman_cmd::Command;
use nix::sys::signal::{Signal, kill};
use tracing::{debug, info, warn};

use super::{GuestInstance, GuestState, is_pid_alive};
use crate::{
    desc::Monitor,
    fs,
    monitor::hmp_quit,
    nic::nic_script_paths,
};

const QUIT_GRACE: Duration = Duration::from_secs(1);
const QUIT_POLL: Duration = Duration::from_millis(100);

impl GuestInstance {
    /// Stops the guest and cleans up everything a start left behind.
    ///
    /// Every step runs even when an earlier one fails; failures are logged. Calling it on
    /// a stopped guest is a no-op apart from the cleanup.
    #[tracing::instrument(skip_all, fields(uuid = %self.uuid(), force = force))]
    pub async fn stop(&mut self, force: bool) {
        self.state = GuestState::Stopping;
        let paths = self.paths();

        let pid = match self.pid().await {
            Ok(pid) => pid,
            Err(err) => {
                warn!("failed to read pid file: {err}");
                None
            }
        };

        if !force {
            self.quit_gracefully(pid).await;
        }

        if let Err(err) = fs::remove_file_if_exists(paths.vnc_file()).await {
            warn!("{err}");
        }

        if let Some(pid) = pid.filter(|pid| is_pid_alive(*pid)) {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => info!(%pid, "killed qemu"),
                Err(err) => warn!(%pid, "failed to kill qemu: {err}"),
            }
        }
        if let Err(err) = fs::remove_file_if_exists(paths.pid_file()).await {
            warn!("{err}");
        }

        // Taps must leave their bridges before guest memory is unmounted.
        self.run_nic_down_scripts().await;
        self.remove_hugepages().await;

        self.state = GuestState::Stopped;
        self.migrating = Default::default();
        info!("guest stopped");
    }

    async fn quit_gracefully(&self, pid: Option<nix::unistd::Pid>) {
        let vnc_port = match self.vnc_port().await {
            Ok(Some(port)) => port,
            Ok(None) => return,
            Err(err) => {
                warn!("failed to read vnc file: {err}");
                return;
            }
        };
        let monitor = self
            .desc
            .hmp_monitor
            .clone()
            .unwrap_or_else(|| Monitor::hmp(vnc_port));
        if let Err(err) = hmp_quit(monitor.port).await {
            debug!("graceful quit failed: {err}");
            return;
        }

        let Some(pid) = pid else { return };
        let mut waited = Duration::ZERO;
        while waited < QUIT_GRACE && is_pid_alive(pid) {
            tokio::time::sleep(QUIT_POLL).await;
            waited += QUIT_POLL;
        }
    }

    async fn run_nic_down_scripts(&self) {
        let paths = self.paths();
        for nic in &self.desc.nics {
            let down = match nic_script_paths(nic, self.host.as_ref(), &paths) {
                Ok(Some((_, down))) => down,
                Ok(None) => continue,
                Err(err) => {
                    warn!(ifname = %nic.ifname, "{err}");
                    continue;
                }
            };
            match fs::path_exists(&down).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!("{err}");
                    continue;
                }
            }
            if let Err(err) = Command::bash(&down).arg(&nic.ifname).run().await {
                warn!(ifname = %nic.ifname, "nic down script failed: {err}");
            }
        }
    }

    /// Unmounts and removes every hugepage directory named after this guest.
    async fn remove_hugepages(&self) {
        let root = &self.host.options().hugepages_path;
        let entries = match fs::path_exists(root).await {
            Ok(true) => match fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("{err}");
                    return;
                }
            },
            Ok(false) => return,
            Err(err) => {
                warn!("{err}");
                return;
            }
        };

        let uuid = self.uuid();
        for dir in entries {
            let owned = dir
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(uuid));
            if !owned || !dir.is_dir() {
                continue;
            }
            if let Err(err) = Command::new("umount").arg(&dir).run().await {
                debug!(dir = %dir.display(), "umount failed: {err}");
            }
            if let Err(err) = fs::remove_dir(&dir).await {
                warn!("{err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use hostman_system::Arch;

    use super::*;
    use crate::{instance::testing, render::testing as render_testing};

    #[tokio::test]
    async fn stop_twice_leaves_no_markers() {
        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let mut instance = GuestInstance::new(render_testing::desc(), host);
        let paths = instance.paths();
        fs::create_dir(paths.home_dir()).await.unwrap();
        // A pid that cannot be alive and a vnc port nobody listens on.
        fs::write_file(paths.pid_file(), b"2147483647\n").await.unwrap();
        fs::write_file(paths.vnc_file(), b"1\n").await.unwrap();
        let (pid_file, vnc_file) = (paths.pid_file(), paths.vnc_file());

        instance.stop(false).await;
        assert!(!pid_file.exists());
        assert!(!vnc_file.exists());
        assert_eq!(instance.state(), GuestState::Stopped);

        instance.stop(false).await;
        assert!(!pid_file.exists());
        assert!(!vnc_file.exists());
        assert_eq!(instance.state(), GuestState::Stopped);
    }

    #[tokio::test]
    async fn stop_removes_guest_hugepage_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let hugepages = dir.path().join("hugepages");
        let own = hugepages.join(render_testing::UUID);
        let other = hugepages.join("0b6a3e61-other-guest");
        std::fs::create_dir_all(&own).unwrap();
        std::fs::create_dir_all(&other).unwrap();

        let mut instance = GuestInstance::new(render_testing::desc(), host);
        instance.stop(true).await;
        assert!(!own.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn stop_runs_nic_down_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let host = testing::host_at(Arch::X86_64, dir.path());
        let mut instance = GuestInstance::new(render_testing::desc(), host);
        let paths = instance.paths();
        fs::create_dir(paths.home_dir()).await.unwrap();
        let marker = paths.home_dir().join("down-ran");
        fs::write_file_with_mode(
            paths.nic_down_script("br0", "vnet1"),
            format!("#!/bin/bash\necho \"$1\" > {}\n", marker.display()).as_bytes(),
            0o755,
        )
        .await
        .unwrap();

        instance.stop(true).await;
        assert_eq!(std::fs::read_to_string(marker).unwrap(), "vnet1\n");
    }
}
