//! A20 gate emulation.
//!
//! The gate is an address-masking policy: with A20 disabled, bit 20 of every
//! physical address is forced low and accesses above 1 MiB alias down to
//! their modulo-1 MiB counterparts. In page numbers that is bit 8 of the
//! page index, cleared from [`MemCore::alias_pagemask_active`].
//!
//! Three policy flags refine the behaviour:
//! - `guest_changeable`: guest port writes are honoured.
//! - `fake_changeable`: the visible status bit tracks guest writes but the
//!   mapping never changes.
//! - `fast_changeable`: the RAM handler applies the mask per access inside
//!   the 1 MiB wraparound band only, so most pages keep stable host
//!   pointers across flips.

use crate::MemorySystem;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Page-number bit corresponding to address line 20.
pub(crate) const A20_PAGE_BIT: u32 = 0x100;

/// Configured A20 gate behaviour (the `a20` setting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum A20Mode {
    /// Full masking emulation, guest controllable.
    #[default]
    Mask,
    /// Locked on; guest writes are ignored.
    On,
    /// Locked off.
    Off,
    /// Locked on, but the visible control bit tracks guest writes.
    OnFake,
    /// Locked off, with a fake control bit.
    OffFake,
    /// Guest controllable, masking applied per access in the RAM handler.
    Fast,
}

impl FromStr for A20Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mask" | "" => Ok(A20Mode::Mask),
            "on" => Ok(A20Mode::On),
            "off" => Ok(A20Mode::Off),
            "on_fake" => Ok(A20Mode::OnFake),
            "off_fake" => Ok(A20Mode::OffFake),
            "fast" => Ok(A20Mode::Fast),
            other => Err(format!("unknown a20 setting '{other}'")),
        }
    }
}

impl fmt::Display for A20Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            A20Mode::Mask => "mask",
            A20Mode::On => "on",
            A20Mode::Off => "off",
            A20Mode::OnFake => "on_fake",
            A20Mode::OffFake => "off_fake",
            A20Mode::Fast => "fast",
        })
    }
}

/// Live A20 state: the visible gate bit, the port 92h latch, and the
/// policy flags derived from [`A20Mode`].
pub(crate) struct A20State {
    pub(crate) enabled: bool,
    pub(crate) control_port: u8,
    pub(crate) guest_changeable: bool,
    pub(crate) fake_changeable: bool,
    pub(crate) fast_changeable: bool,
}

impl A20State {
    pub(crate) fn from_mode(mode: A20Mode) -> A20State {
        let mut s = A20State {
            enabled: false,
            control_port: 0,
            guest_changeable: true,
            fake_changeable: false,
            fast_changeable: false,
        };
        match mode {
            A20Mode::Mask => {}
            A20Mode::On => {
                s.guest_changeable = false;
                s.enabled = true;
            }
            A20Mode::OnFake => {
                s.guest_changeable = false;
                s.fake_changeable = true;
                s.enabled = true;
            }
            A20Mode::Off => {
                s.guest_changeable = false;
            }
            A20Mode::OffFake => {
                s.guest_changeable = false;
                s.fake_changeable = true;
            }
            A20Mode::Fast => {
                s.fast_changeable = true;
            }
        }
        s
    }

    #[cfg(test)]
    pub(crate) fn masked_default() -> A20State {
        A20State::from_mode(A20Mode::Mask)
    }
}

impl MemorySystem {
    pub fn a20_enabled(&self) -> bool {
        self.core.a20.enabled
    }

    /// Raw port 92h latch contents (bit 1 is merged in at read time).
    pub fn a20_control_port(&self) -> u8 {
        self.core.a20.control_port
    }

    pub fn set_a20_control_port(&mut self, val: u8) {
        self.core.a20.control_port = val;
    }

    /// Sets the A20 gate, subject to the configured policy. When the
    /// masking semantics change, the active alias mask is updated and the
    /// TLB flushed before the next access.
    pub fn a20_enable(&mut self, enabled: bool) {
        if self.core.a20.enabled != enabled {
            debug!(enabled, "a20 gate");
        }

        if self.core.a20.guest_changeable || self.core.a20.fake_changeable {
            self.core.a20.enabled = enabled;
        }

        if !self.core.a20.fake_changeable && (self.core.alias_pagemask & A20_PAGE_BIT) != 0 {
            let old = self.core.alias_pagemask_active;
            if self.core.a20.enabled {
                self.core.alias_pagemask_active |= A20_PAGE_BIT;
            } else {
                self.core.alias_pagemask_active &= !A20_PAGE_BIT;
            }
            if old != self.core.alias_pagemask_active {
                self.flush_tlb();
            }
        }
    }

    /// Switches the gate policy at runtime (the `A20GATE SET` semantics):
    /// resets to guest-controllable, applies the mode, and drives the gate
    /// to the mode's initial level.
    pub fn a20_set_mode(&mut self, mode: A20Mode) {
        self.core.a20.fast_changeable = false;
        self.core.a20.fake_changeable = false;
        self.core.a20.guest_changeable = true;
        self.a20_enable(true);

        let target = A20State::from_mode(mode);
        self.a20_enable(target.enabled);
        self.core.a20.guest_changeable = target.guest_changeable;
        self.core.a20.fake_changeable = target.fake_changeable;
        self.core.a20.fast_changeable = target.fast_changeable;
    }

    /// Hardware-reset override: the BIOS needs the gate on to POST on a 386
    /// or later, regardless of the configured mode. The configured policy is
    /// reapplied once the BIOS hands control back.
    pub fn a20_on_reset(&mut self) {
        self.core.a20.control_port = 0;
        self.core.a20.enabled = true;
        self.core.a20.fake_changeable = false;
        self.core.a20.guest_changeable = true;
        self.a20_enable(true);
    }
}
