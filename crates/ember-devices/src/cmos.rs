//! Shared latches owned by out-of-scope firmware models.
//!
//! The RTC/CMOS emulation writes the shutdown byte (CMOS register 0x0F)
//! before triggering a CPU reset; the PC-98 BIOS sets the SHUT0/SHUT1
//! latches. The reset dispatcher only reads them, so both are thin
//! cloneable cells.

use std::cell::Cell;
use std::rc::Rc;

/// CMOS register 0x0F: selects post-reset behaviour.
#[derive(Clone, Default)]
pub struct CmosShutdownLatch {
    byte: Rc<Cell<u8>>,
}

impl CmosShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u8 {
        self.byte.get()
    }

    pub fn set(&self, byte: u8) {
        self.byte.set(byte);
    }
}

/// PC-98 SHUT0/SHUT1 reset latches; they supersede the CMOS shutdown byte
/// on that architecture.
#[derive(Clone, Default)]
pub struct Pc98ShutLatches {
    shut0: Rc<Cell<bool>>,
    shut1: Rc<Cell<bool>>,
}

impl Pc98ShutLatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shut0(&self) -> bool {
        self.shut0.get()
    }

    pub fn shut1(&self) -> bool {
        self.shut1.get()
    }

    pub fn set_shut0(&self, v: bool) {
        self.shut0.set(v);
    }

    pub fn set_shut1(&self, v: bool) {
        self.shut1.set(v);
    }
}
