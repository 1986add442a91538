use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{Arch, ArchError, MemorySize};

const KVM_DEVICE: &str = "/dev/kvm";
const MEMINFO: &str = "/proc/meminfo";
const OSRELEASE: &str = "/proc/sys/kernel/osrelease";
const NESTED_PARAMS: [&str; 2] = [
    "/sys/module/kvm_intel/parameters/nested",
    "/sys/module/kvm_amd/parameters/nested",
];

#[derive(Error, Debug)]
pub enum HostCapsError {
    #[error(transparent)]
    Arch(#[from] ArchError),

    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Virtualization facts about the host, gathered once at agent start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCaps {
    pub arch: Arch,
    pub kvm: bool,
    pub nested_virt: bool,
    /// Size of one hugepage, present only when the host has hugepages reserved.
    pub hugepage_size: Option<MemorySize>,
    pub kernel_version: String,
}

impl HostCaps {
    pub fn detect() -> Result<Self, HostCapsError> {
        let arch = Arch::detect()?;
        let kvm = Path::new(KVM_DEVICE).exists();
        let nested_virt = NESTED_PARAMS.iter().any(|path| {
            fs::read_to_string(path)
                .map(|value| matches!(value.trim(), "Y" | "1"))
                .unwrap_or(false)
        });
        let meminfo = read(MEMINFO)?;
        let hugepage_size = parse_hugepages(&meminfo);
        let kernel_version = read(OSRELEASE)?.trim().to_owned();

        let caps = Self {
            arch,
            kvm,
            nested_virt,
            hugepage_size,
            kernel_version,
        };
        debug!(?caps, "detected host capabilities");
        Ok(caps)
    }

    pub fn is_hugepages_enabled(&self) -> bool {
        self.hugepage_size.is_some()
    }
}

fn read(path: &str) -> Result<String, HostCapsError> {
    fs::read_to_string(path).map_err(|source| HostCapsError::Read {
        path: PathBuf::from(path),
        source,
    })
}

/// Returns the hugepage size when `/proc/meminfo` reports reserved hugepages.
pub fn parse_hugepages(meminfo: &str) -> Option<MemorySize> {
    let mut total = 0u64;
    let mut size_kb = None;
    for line in meminfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches("kB").trim();
        match key {
            "HugePages_Total" => total = value.parse().unwrap_or(0),
            "Hugepagesize" => size_kb = value.parse().ok(),
            _ => {}
        }
    }
    if total > 0 {
        size_kb.map(MemorySize::from_kb)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO_HUGE: &str = "\
MemTotal:       131811832 kB
HugePages_Total:   32768
HugePages_Free:    30720
Hugepagesize:       2048 kB
";

    #[test]
    fn hugepages_reserved() {
        let size = parse_hugepages(MEMINFO_HUGE).unwrap();
        assert_eq!(size.as_kb(), 2048);
    }

    #[test]
    fn hugepages_not_reserved() {
        let meminfo = "HugePages_Total:       0\nHugepagesize:       2048 kB\n";
        assert_eq!(parse_hugepages(meminfo), None);
    }
}
