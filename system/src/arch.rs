use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchError {
    #[error("unsupported cpu architecture: {0}")]
    Unsupported(String),
}

impl Arch {
    /// Architecture of the running host.
    pub fn detect() -> Result<Self, ArchError> {
        Self::from_str(std::env::consts::ARCH)
    }

    /// Suffix of the `qemu-system-*` binary for this architecture.
    pub fn qemu_suffix(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

impl FromStr for Arch {
    type Err = ArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "x86-64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => Err(ArchError::Unsupported(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_aliases() {
        assert_eq!("amd64".parse::<Arch>(), Ok(Arch::X86_64));
        assert_eq!("arm64".parse::<Arch>(), Ok(Arch::Aarch64));
        assert_eq!(
            "riscv64".parse::<Arch>(),
            Err(ArchError::Unsupported("riscv64".to_owned()))
        );
    }

    #[test]
    fn serde_names() {
        let arch: Arch = serde_json::from_str(r#""aarch64""#).unwrap();
        assert_eq!(arch, Arch::Aarch64);
        assert_eq!(serde_json::to_string(&Arch::X86_64).unwrap(), r#""x86_64""#);
    }
}
