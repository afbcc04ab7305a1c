#![forbid(unsafe_code)]

//! System control and reset devices: the PS/2 system control port A (92h),
//! the PC-98 A20 and memory-space ports, the CMOS shutdown latch and the
//! software CPU reset dispatcher.

pub mod cmos;
pub mod pc98;
pub mod reset;
pub mod sysctrl;

pub use cmos::{CmosShutdownLatch, Pc98ShutLatches};
pub use pc98::{Pc98A20Ports, Pc98MemSpacePort};
pub use reset::SoftwareResetDispatcher;
pub use sysctrl::SystemControlPortA;
