//! PC-98 A20 and memory-space I/O ports.
//!
//! - Port `F2h` read: bit 0 set means A20 is *masked* (not enabled).
//! - Port `F2h` write: any value unmasks A20.
//! - Port `F6h` write: `0000 001x` sets the A20 mask to `x`.
//! - Port `43Bh` read: bit 2 set means the 15 MiB memory hole is not in
//!   use and the address space is continuous.

use ember_mem::SharedMemorySystem;
use ember_platform::io::PortIoDevice;
use tracing::warn;

pub const PC98_A20_STATUS_PORT: u16 = 0xF2;
pub const PC98_A20_CONTROL_PORT: u16 = 0xF6;
pub const PC98_MEMSPACE_PORT: u16 = 0x43B;

/// Ports F2h/F6h. Register one instance per port.
#[derive(Clone)]
pub struct Pc98A20Ports {
    mem: SharedMemorySystem,
}

impl Pc98A20Ports {
    pub fn new(mem: SharedMemorySystem) -> Pc98A20Ports {
        Pc98A20Ports { mem }
    }
}

impl PortIoDevice for Pc98A20Ports {
    fn read(&mut self, port: u16, _size: u8) -> u32 {
        if port == PC98_A20_STATUS_PORT {
            // Bit 0 reports the masked state, the inverse of "enabled".
            if self.mem.borrow().a20_enabled() {
                0x00
            } else {
                0x01
            }
        } else {
            !0u32
        }
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        match port {
            // Writing F2h unmasks A20 regardless of the value.
            PC98_A20_STATUS_PORT => self.mem.borrow_mut().a20_enable(true),
            PC98_A20_CONTROL_PORT => {
                if value & 0xFE == 0x02 {
                    self.mem.borrow_mut().a20_enable(value & 1 == 0);
                } else {
                    warn!(value, "unexpected PC-98 port F6h value");
                }
            }
            _ => {}
        }
    }
}

/// Port 43Bh: some software checks this register for the 15 MiB memory
/// hole instead of the BIOS data area.
#[derive(Clone)]
pub struct Pc98MemSpacePort {
    mem: SharedMemorySystem,
}

impl Pc98MemSpacePort {
    pub fn new(mem: SharedMemorySystem) -> Pc98MemSpacePort {
        Pc98MemSpacePort { mem }
    }
}

impl PortIoDevice for Pc98MemSpacePort {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        let mem = self.mem.borrow();
        if mem.isa_memory_hole_15mb() || mem.total_pages() <= 0xF00 {
            // The hole region is in use by the system.
            0x00
        } else {
            0x04
        }
    }

    fn write(&mut self, _port: u16, _size: u8, _value: u32) {}
}
