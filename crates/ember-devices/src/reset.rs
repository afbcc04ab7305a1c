//! Software CPU reset dispatch.
//!
//! A software-triggered CPU reset (port 92h bit 0, keyboard controller
//! pulse, triple fault) does not necessarily reboot the machine: on PC/AT
//! the CMOS shutdown byte selects what the "BIOS" does after the reset, and
//! on PC-98 the SHUT0/SHUT1 latches do. The dispatcher decodes those and
//! produces a [`CpuRedirect`] describing where execution continues. The
//! instruction that triggered the reset must not be resumed; the redirect
//! is both returned and stored in the shared latch so the interpreter loop
//! can unwind the in-flight frame.

use crate::cmos::{CmosShutdownLatch, Pc98ShutLatches};
use ember_mem::{MachineProfile, SharedMemorySystem};
use ember_platform::reset::{BlockMoveFrame, CpuRedirect, RedirectLatch};
use tracing::{debug, error, warn};

/// Location of the double-word reset vector in the BIOS data area
/// (`0040:0067`).
const BDA_RESET_VECTOR: u32 = 0x400 + 0x67;

/// PC-98 continue-after-reset stack pointer (`0000:0404`).
const PC98_RESET_SP: u32 = 0x404;

pub struct SoftwareResetDispatcher {
    mem: SharedMemorySystem,
    shutdown: CmosShutdownLatch,
    pc98_shut: Pc98ShutLatches,
    latch: RedirectLatch,
    machine: MachineProfile,
    custom_bios: bool,
}

impl SoftwareResetDispatcher {
    pub fn new(
        mem: SharedMemorySystem,
        shutdown: CmosShutdownLatch,
        pc98_shut: Pc98ShutLatches,
        latch: RedirectLatch,
    ) -> SoftwareResetDispatcher {
        let (machine, custom_bios) = {
            let mem = mem.borrow();
            (mem.machine(), mem.config().custom_bios)
        };
        SoftwareResetDispatcher {
            mem,
            shutdown,
            pc98_shut,
            latch,
            machine,
            custom_bios,
        }
    }

    pub fn latch(&self) -> RedirectLatch {
        self.latch.clone()
    }

    /// Decodes the pending reset. Returns `None` only with a custom BIOS
    /// loaded, which owns reset behaviour entirely; every other outcome is
    /// also stored in the redirect latch.
    pub fn on_software_cpu_reset(&self) -> Option<CpuRedirect> {
        if self.custom_bios {
            debug!("software CPU reset ignored: custom BIOS loaded");
            return None;
        }

        let redirect = match self.machine {
            MachineProfile::Pc98 => self.decode_pc98(),
            MachineProfile::PcAt => self.decode_cmos(),
        };
        self.latch.set(redirect);
        Some(redirect)
    }

    fn decode_cmos(&self) -> CpuRedirect {
        let code = self.shutdown.get();
        match code {
            // JMP through the BIOS data area double-word vector; 0x05 also
            // sends an EOI to the interrupt controller.
            0x05 | 0x0A => {
                let mem = self.mem.borrow();
                let offset = mem.phys_read16(BDA_RESET_VECTOR);
                let seg = mem.phys_read16(BDA_RESET_VECTOR + 2);
                debug!(code, seg, offset, "shutdown byte selects reset vector jump");
                CpuRedirect::JumpResetVector {
                    seg,
                    offset,
                    send_eoi: code == 0x05,
                }
            }
            // Return from an INT 15h 286 block move. The reset vector holds
            // SS:SP of a stack carrying segment registers, a POPA frame and
            // an IRET image; pop the lot so the CPU can resume in one step.
            0x09 => {
                let mut mem = self.mem.borrow_mut();
                let sp = mem.phys_read16(BDA_RESET_VECTOR);
                let ss = mem.phys_read16(BDA_RESET_VECTOR + 2);
                warn!(
                    ss,
                    sp, "shutdown byte 0x09: INT 15h block-move return (286 protected mode exit)"
                );

                let mut sp = sp;
                let mut pop16 = || {
                    let val = mem.read16(u32::from(ss) * 16 + u32::from(sp));
                    sp = sp.wrapping_add(2);
                    val
                };

                let es = pop16();
                let ds = pop16();
                let di = pop16();
                let si = pop16();
                let bp = pop16();
                let _sp_image = pop16();
                let bx = pop16();
                let dx = pop16();
                let cx = pop16();
                let ax = pop16();
                let ip = pop16();
                let cs = pop16();
                let flags = pop16();

                CpuRedirect::Int15BlockMoveReturn {
                    frame: BlockMoveFrame {
                        ss,
                        sp,
                        es,
                        ds,
                        di,
                        si,
                        bp,
                        bx,
                        dx,
                        cx,
                        ax,
                        ip,
                        cs,
                        flags,
                    },
                }
            }
            _ => {
                debug!(code, "shutdown byte selects full reboot");
                CpuRedirect::FullReboot
            }
        }
    }

    fn decode_pc98(&self) -> CpuRedirect {
        let (shut0, shut1) = (self.pc98_shut.shut0(), self.pc98_shut.shut1());
        if shut0 {
            if !shut1 {
                // The BIOS would print "SYSTEM SHUTDOWN" and halt; the
                // nearest recoverable behaviour is a full reboot.
                error!("PC-98 invalid reset (SHUT0=1 SHUT1=0)");
            }
            return CpuRedirect::FullReboot;
        }

        // SHUT0=0: continue after reset. The BIOS loads SS:SP from
        // 0000:0404 and RETFs.
        let mut mem = self.mem.borrow_mut();
        let sp = mem.read16(PC98_RESET_SP);
        let ss = mem.read16(PC98_RESET_SP + 2);

        let ip = mem.read16(u32::from(ss) * 16 + u32::from(sp));
        let cs = mem.read16(u32::from(ss) * 16 + u32::from(sp) + 2);
        let sp = sp.wrapping_add(4);

        debug!(ss, sp, cs, ip, "PC-98 reset and continue");
        CpuRedirect::Pc98ResumeAfterReset { ss, sp, cs, ip }
    }
}
