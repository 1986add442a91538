use std::path::PathBuf;

use hostman_system::Arch;
use tracing::{debug, warn};

use crate::options::HostOptions;

const LATEST: &str = "latest";

/// Where the QEMU binary for a launch comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QemuBinary {
    /// An installed build pinned by version.
    Versioned(PathBuf),
    /// The host's default `qemu-system-{arch}`.
    Default(String),
}

impl QemuBinary {
    /// Picks the requested build, or the host's default version when none is requested.
    ///
    /// `latest` always means the default `qemu-system-{arch}` lookup, whatever the host pins.
    pub fn select(options: &HostOptions, requested: Option<&str>, arch: Arch) -> Self {
        let default = || QemuBinary::Default(format!("qemu-system-{}", arch.qemu_suffix()));
        let version = match requested {
            Some(LATEST) => return default(),
            Some(version) => Some(version),
            None => options
                .default_qemu_version
                .as_deref()
                .filter(|version| *version != LATEST),
        };
        let Some(version) = version else {
            return default();
        };
        match options.qemu_binaries.get(version) {
            Some(path) => QemuBinary::Versioned(path.clone()),
            None => {
                debug!(%version, "qemu version not installed, using default binary");
                default()
            }
        }
    }

    /// Absolute path when it can be found on `PATH`, otherwise the bare name.
    pub fn path(&self) -> PathBuf {
        match self {
            QemuBinary::Versioned(path) => path.clone(),
            QemuBinary::Default(name) => which::which(name).unwrap_or_else(|err| {
                warn!(%name, "qemu binary not found on PATH: {err}");
                PathBuf::from(name)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> HostOptions {
        let mut options = HostOptions::default();
        options
            .qemu_binaries
            .insert("4.2.0".to_owned(), PathBuf::from("/usr/local/qemu-4.2.0/bin/qemu"));
        options
    }

    #[test]
    fn pinned_version() {
        assert_eq!(
            QemuBinary::select(&options(), Some("4.2.0"), Arch::X86_64),
            QemuBinary::Versioned(PathBuf::from("/usr/local/qemu-4.2.0/bin/qemu"))
        );
    }

    #[test]
    fn latest_uses_default_lookup() {
        let binary = QemuBinary::select(&options(), Some("latest"), Arch::X86_64);
        assert_eq!(binary, QemuBinary::Default("qemu-system-x86_64".to_owned()));
        assert!(!binary.path().to_string_lossy().contains("latest"));
    }

    #[test]
    fn latest_ignores_host_default_version() {
        let mut options = options();
        options.default_qemu_version = Some("4.2.0".to_owned());
        assert_eq!(
            QemuBinary::select(&options, Some("latest"), Arch::X86_64),
            QemuBinary::Default("qemu-system-x86_64".to_owned())
        );
    }

    #[test]
    fn unknown_version_uses_default_lookup() {
        assert_eq!(
            QemuBinary::select(&options(), Some("9.9.9"), Arch::Aarch64),
            QemuBinary::Default("qemu-system-aarch64".to_owned())
        );
    }

    #[test]
    fn host_default_version() {
        let mut options = options();
        options.default_qemu_version = Some("4.2.0".to_owned());
        assert_eq!(
            QemuBinary::select(&options, None, Arch::X86_64),
            QemuBinary::Versioned(PathBuf::from("/usr/local/qemu-4.2.0/bin/qemu"))
        );
    }
}
