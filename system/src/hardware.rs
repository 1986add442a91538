use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuCount(u16);

impl CpuCount {
    pub const fn new(count: u16) -> Self {
        Self(count)
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl Display for CpuCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemorySize(u64); // In bytes

impl MemorySize {
    pub const fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_kb(kb: u64) -> Self {
        Self(kb * 1024)
    }

    pub fn as_kb(&self) -> u64 {
        self.0 / 1024
    }
}

impl From<MemorySize> for u64 {
    fn from(value: MemorySize) -> Self {
        value.0
    }
}
