use std::path::{Path, PathBuf};

/// Well-known files under a guest's home directory.
pub struct GuestPaths<'a> {
    home_dir: &'a Path,
}

impl<'a> GuestPaths<'a> {
    pub fn new(home_dir: &'a Path) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &'a Path {
        self.home_dir
    }

    pub fn desc(&self) -> PathBuf {
        self.home_dir.join("desc.json")
    }

    pub fn start_script(&self) -> PathBuf {
        self.home_dir.join("startvm")
    }

    pub fn stop_script(&self) -> PathBuf {
        self.home_dir.join("stopvm")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home_dir.join("pid")
    }

    pub fn vnc_file(&self) -> PathBuf {
        self.home_dir.join("vnc")
    }

    pub fn log_file(&self) -> PathBuf {
        self.home_dir.join("log")
    }

    pub fn memclean_log_dir(&self) -> &'a Path {
        self.home_dir
    }

    pub fn qga_socket(&self) -> PathBuf {
        self.home_dir.join("qga.sock")
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.home_dir.join("pki")
    }

    pub fn encrypt_key(&self) -> PathBuf {
        self.home_dir.join("encrypt_key")
    }

    pub fn nic_up_script(&self, bridge: &str, ifname: &str) -> PathBuf {
        self.home_dir.join(format!("if-up-{bridge}-{ifname}.sh"))
    }

    pub fn nic_down_script(&self, bridge: &str, ifname: &str) -> PathBuf {
        self.home_dir.join(format!("if-down-{bridge}-{ifname}.sh"))
    }
}

/// Per-guest hugepage mount point under the host hugepage root.
pub fn hugepages_dir(hugepages_root: &Path, uuid: &str) -> PathBuf {
    hugepages_root.join(uuid)
}
