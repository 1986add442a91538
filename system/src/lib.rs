mod arch;
mod hardware;
mod host;

pub use crate::arch::*;
pub use crate::hardware::*;
pub use crate::host::*;
