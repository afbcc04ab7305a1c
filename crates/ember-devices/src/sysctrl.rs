//! PS/2 system control port A (I/O port 92h).
//!
//! Bit 1 drives the A20 gate, bit 0 requests a CPU reset (when the
//! configuration allows it). Reads return the latched byte with the live
//! A20 state merged into bit 1.

use crate::reset::SoftwareResetDispatcher;
use ember_mem::SharedMemorySystem;
use ember_platform::io::PortIoDevice;
use std::rc::Rc;
use tracing::{info, warn};

pub const SYSTEM_CONTROL_PORT_A: u16 = 0x92;

pub struct SystemControlPortA {
    mem: SharedMemorySystem,
    reset: Rc<SoftwareResetDispatcher>,
    allow_reset: bool,
}

impl SystemControlPortA {
    pub fn new(
        mem: SharedMemorySystem,
        reset: Rc<SoftwareResetDispatcher>,
        allow_reset: bool,
    ) -> SystemControlPortA {
        SystemControlPortA {
            mem,
            reset,
            allow_reset,
        }
    }
}

impl PortIoDevice for SystemControlPortA {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        let mem = self.mem.borrow();
        let mut val = mem.a20_control_port();
        if mem.a20_enabled() {
            val |= 0x02;
        }
        val.into()
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        let value = value as u8;
        {
            let mut mem = self.mem.borrow_mut();
            mem.set_a20_control_port(value & !0x02);
            mem.a20_enable(value & 0x02 != 0);
        }

        if value & 0x01 != 0 {
            if self.allow_reset {
                info!("restart requested through port 92h");
                self.reset.on_software_cpu_reset();
            } else {
                warn!("port 92h written with bit 0 set, reset not allowed");
            }
        }
    }
}
