//! Host-side controller for KVM guests: descriptors in, QEMU processes out.

pub mod arch;
pub mod arp;
pub mod certs;
pub mod cmdline;
pub mod desc;
pub mod fs;
pub mod host;
pub mod instance;
pub mod launcher;
pub mod monitor;
pub mod nic;
pub mod options;
pub mod paths;
pub mod render;

pub use crate::desc::GuestDesc;
pub use crate::host::{Host, HostInfo};
pub use crate::instance::{
    GuestInstance, GuestState, GuestStatus, InstanceError, InstanceStartError, Started,
};
pub use crate::options::HostOptions;
pub use crate::render::{RenderError, RenderedScripts, RuntimeOverrides, render};
