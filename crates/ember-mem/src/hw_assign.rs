//! Physical address assignment for device MMIO windows.
//!
//! Devices that need a fixed physical window (below the chipset range at
//! `0xFE000000`) request one here at init time and install their own page
//! handlers over the returned base.

use crate::MemorySystem;
use tracing::debug;

const HW_ASSIGN_LIMIT: u32 = 0xFE00_0000;

impl MemorySystem {
    /// Hands out a `size`-byte window, aligned to `size` (which must be a
    /// power of two). Returns 0 when the request cannot be honoured.
    pub fn hardware_allocate(&mut self, name: &str, size: u32) -> u32 {
        let mut assign = 0u32;

        if size != 0 && size.is_power_of_two() {
            // Wider arithmetic: the cursor can step past 4 GiB on the last
            // assignment and must park there, not wrap.
            let mut cursor = u64::from(self.hw_next_assign);
            if cursor < u64::from(HW_ASSIGN_LIMIT) {
                // Round the cursor up to the alignment of this request.
                cursor = (cursor + u64::from(size) - 1) & !(u64::from(size) - 1);
            }
            if cursor < u64::from(HW_ASSIGN_LIMIT) {
                assign = cursor as u32;
                cursor += u64::from(size);
                debug!(
                    name,
                    base = assign,
                    end = assign as u64 + u64::from(size) - 1,
                    "assigned device physical address window"
                );
            }
            self.hw_next_assign = cursor.min(u64::from(u32::MAX)) as u32;
        }

        if assign == 0 {
            debug!(name, size, "unable to assign a physical address window");
        }

        assign
    }
}
