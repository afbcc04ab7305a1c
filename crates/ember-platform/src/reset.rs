//! CPU reset and execution-redirect plumbing.
//!
//! A guest can trigger a CPU reset from inside an I/O write (port 92h bit 0,
//! the keyboard controller pulse line, a triple fault recovered by the BIOS).
//! When that happens the instruction that performed the write must not be
//! resumed: the interpreter has to unwind the in-flight frame and continue at
//! whatever the reset decode selected.
//!
//! That non-local exit is modelled as a [`CpuRedirect`] value stored in a
//! [`RedirectLatch`] shared between the reset dispatcher and the interpreter
//! loop. The loop checks the latch after every I/O access that can reach the
//! dispatcher and pattern-matches on the redirect instead of returning to the
//! faulting instruction.

use std::cell::RefCell;
use std::rc::Rc;

/// What kind of reset the guest requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// CPU-only reset; the chipset decodes the CMOS shutdown byte.
    Cpu,
    /// Full system reset.
    System,
}

/// Register file recovered from an INT 15h 286 block-move return
/// (CMOS shutdown code 0x09).
///
/// The BIOS data area reset vector holds SS:SP of a stack carrying ES, DS, a
/// POPA-style frame and an IRET image. The dispatcher pops all of it so the
/// CPU core can load the whole state in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMoveFrame {
    pub ss: u16,
    /// SP after every pop below has been consumed.
    pub sp: u16,
    pub es: u16,
    pub ds: u16,
    pub di: u16,
    pub si: u16,
    pub bp: u16,
    pub bx: u16,
    pub dx: u16,
    pub cx: u16,
    pub ax: u16,
    /// IRET image.
    pub ip: u16,
    pub cs: u16,
    pub flags: u16,
}

/// Where execution continues after a software CPU reset.
///
/// The interpreter loop treats any of these as "abort the current
/// instruction"; only `FullReboot` tears the machine down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuRedirect {
    /// No special shutdown code: reboot the machine.
    FullReboot,
    /// CMOS shutdown codes 0x05/0x0A: real mode, jump through the BIOS data
    /// area double-word reset vector. `send_eoi` distinguishes 0x05.
    JumpResetVector { seg: u16, offset: u16, send_eoi: bool },
    /// CMOS shutdown code 0x09: resume an INT 15h 286 block move.
    Int15BlockMoveReturn { frame: BlockMoveFrame },
    /// PC-98 SHUT0=0: real mode, load SS:SP from 0000:0404 and RETF.
    Pc98ResumeAfterReset { ss: u16, sp: u16, cs: u16, ip: u16 },
}

/// Cloneable latch carrying a pending [`CpuRedirect`].
///
/// At most one redirect is pending at a time; a second trigger before the
/// loop drains the latch keeps the first (the instruction that set it never
/// completed, so nothing else can have run).
#[derive(Clone, Default)]
pub struct RedirectLatch {
    inner: Rc<RefCell<Option<CpuRedirect>>>,
}

impl RedirectLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `redirect` unless one is already pending.
    pub fn set(&self, redirect: CpuRedirect) {
        let mut slot = self.inner.borrow_mut();
        if slot.is_none() {
            *slot = Some(redirect);
        }
    }

    /// Takes the pending redirect, leaving the latch empty.
    pub fn take(&self) -> Option<CpuRedirect> {
        self.inner.borrow_mut().take()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().is_some()
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().take();
    }
}
