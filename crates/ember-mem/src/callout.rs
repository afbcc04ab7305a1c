//! Device claim callouts.
//!
//! A device that responds to physical memory does not install page handlers
//! eagerly. It installs a *callout*: a claim over a page pattern (base page
//! plus alias/range masks) and a function that, asked about a concrete
//! page, returns the handler servicing it or `None`. The slow path polls
//! the callout buckets the first time an unresolved page is touched and
//! caches the winning handler in the table slot.
//!
//! Callers never hold references into the bucket vectors; they hold opaque
//! [`CalloutHandle`]s and pin slots with `get`/`put`. Growing a bucket is
//! only permitted while nothing is pinned, so recycled slots stay valid for
//! the lifetime of the handle.

use crate::handler::PageHandler;
use crate::{MemorySystem, PageNum};
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Full 28-bit page mask: no aliasing, decode every address line.
pub const MEMMASK_FULL: u32 = 0x0FFF_FFFF;

/// ISA 24-bit address decode: devices alias every 16 MiB.
pub const MEMMASK_ISA_24BIT: u32 = 0x0000_0FFF;

/// Mask covering a naturally-aligned range of `pages` (a power of two).
pub fn memmask_range(pages: u32) -> u32 {
    debug_assert!(pages.is_power_of_two());
    MEMMASK_FULL & !(pages - 1)
}

/// Combines a decode-width mask with a range mask.
pub fn memmask_combine(a: u32, b: u32) -> u32 {
    a & b
}

/// Which bus bucket a callout lives in. The slow path polls buckets in
/// declaration order: motherboard first, then PCI (when the PCI bus is
/// enabled), then ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalloutType {
    Motherboard,
    Pci,
    Isa,
}

const CALLOUT_TYPES: usize = 3;

impl CalloutType {
    fn index(self) -> usize {
        match self {
            CalloutType::Motherboard => 0,
            CalloutType::Pci => 1,
            CalloutType::Isa => 2,
        }
    }
}

/// Opaque handle naming a callout slot: `(bucket, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalloutHandle {
    pub(crate) ty: CalloutType,
    pub(crate) index: u32,
}

/// Claim function: given the callout and a page matching its pattern,
/// return the handler for that page, or `None` to decline.
pub type CalloutFn = Box<dyn Fn(&CalloutObject, PageNum) -> Option<Rc<dyn PageHandler>>>;

/// One registry slot.
pub struct CalloutObject {
    pub(crate) allocated: bool,
    pub(crate) installed: bool,
    pub(crate) getcounter: u32,

    pub(crate) base_page: PageNum,
    /// Raw user-supplied mask.
    pub(crate) page_mask: u32,
    /// Contiguous low zero-bit run of `page_mask`: the in-range offset bits.
    pub(crate) range_mask: u32,
    /// `range_mask` extended by the middle one-bits: distance between
    /// aliases of the range.
    pub(crate) alias_mask: u32,

    pub(crate) handler: Option<CalloutFn>,
}

impl CalloutObject {
    fn empty() -> CalloutObject {
        CalloutObject {
            allocated: false,
            installed: false,
            getcounter: 0,
            base_page: 0,
            page_mask: 0,
            range_mask: 0,
            alias_mask: 0,
            handler: None,
        }
    }

    pub fn base_page(&self) -> PageNum {
        self.base_page
    }

    pub fn page_mask(&self) -> u32 {
        self.page_mask
    }

    pub fn range_mask(&self) -> u32 {
        self.range_mask
    }

    pub fn alias_mask(&self) -> u32 {
        self.alias_mask
    }

    /// Whether `page` falls inside this callout's claim pattern.
    pub fn matches_page(&self, page: PageNum) -> bool {
        (page & self.alias_mask & !self.range_mask) == self.base_page
    }
}

/// Splits a raw page mask into `(range_mask, alias_mask)`.
///
/// A valid mask is, from MSB to LSB: zero or more 0 bits, one or more
/// 1 bits, zero or more 0 bits. The low zero run is the range (how many
/// pages the device occupies), the one run extends it to the alias
/// distance.
///
/// Example: a 64 KiB-aliased device with a 16-page window under a 28-bit
/// decode has `page_mask = 0x0FFF_FFF0`, `range_mask = 0xF`,
/// `alias_mask = 0x0FFF_FFFF`.
fn derive_masks(page_mask: u32) -> Option<(u32, u32)> {
    if page_mask == 0 || (page_mask & !MEMMASK_FULL) != 0 {
        return None;
    }

    let mut m = 1u32;
    let mut range_mask = 0u32;
    let test = page_mask ^ MEMMASK_FULL;
    while (test & m) == m {
        range_mask = m;
        m = (m << 1) + 1;
    }

    if (page_mask & range_mask) != 0 || ((range_mask + 1) & range_mask) != 0 {
        return None;
    }

    let mut alias_mask = range_mask;
    let test = page_mask + range_mask;
    while (test & m) == m {
        alias_mask = m;
        m = (m << 1) + 1;
    }

    // Any bits above the alias run must be zero, or the mask had a second
    // one-band.
    if (page_mask ^ range_mask ^ alias_mask) != 0 || ((alias_mask + 1) & alias_mask) != 0 {
        return None;
    }

    Some((range_mask, alias_mask))
}

struct CalloutBucket {
    slots: Vec<CalloutObject>,
    alloc_from: usize,
}

const BUCKET_INITIAL_SIZE: usize = 64;
const BUCKET_MAX_SIZE: usize = 4096;

impl CalloutBucket {
    fn new() -> CalloutBucket {
        let mut slots = Vec::new();
        slots.resize_with(BUCKET_INITIAL_SIZE, CalloutObject::empty);
        CalloutBucket {
            slots,
            alloc_from: 0,
        }
    }

    fn pinned(&self) -> bool {
        self.slots.iter().any(|s| s.getcounter > 0)
    }

    fn allocate(&mut self) -> Option<u32> {
        loop {
            while self.alloc_from < self.slots.len() {
                let idx = self.alloc_from;
                if !self.slots[idx].allocated {
                    let slot = &mut self.slots[idx];
                    slot.allocated = true;
                    debug_assert!(!slot.installed);
                    self.alloc_from = idx + 1;
                    return Some(idx as u32);
                }
                self.alloc_from += 1;
            }

            // Slots exhausted: double the vector, unless a caller still
            // pins a slot (resizing would invalidate its claim) or the
            // safety bound is hit.
            if self.slots.len() >= BUCKET_MAX_SIZE || self.pinned() {
                return None;
            }
            let new_size = self.slots.len() * 2;
            warn!(new_size, "expanding callout bucket");
            self.alloc_from = self.slots.len();
            self.slots.resize_with(new_size, CalloutObject::empty);
        }
    }
}

pub(crate) struct CalloutRegistry {
    buckets: [CalloutBucket; CALLOUT_TYPES],
}

impl CalloutRegistry {
    pub(crate) fn new() -> CalloutRegistry {
        CalloutRegistry {
            buckets: [CalloutBucket::new(), CalloutBucket::new(), CalloutBucket::new()],
        }
    }

    fn slot(&self, handle: CalloutHandle) -> Option<&CalloutObject> {
        let slot = self.buckets[handle.ty.index()]
            .slots
            .get(handle.index as usize)?;
        slot.allocated.then_some(slot)
    }

    fn slot_mut(&mut self, handle: CalloutHandle) -> Option<&mut CalloutObject> {
        let slot = self.buckets[handle.ty.index()]
            .slots
            .get_mut(handle.index as usize)?;
        slot.allocated.then_some(slot)
    }

    /// Polls one bucket for `page`. Returns the first claiming handler and
    /// the number of claimants found. On a multi-claim conflict the scan
    /// stops at the second claimant: the caller already knows not to cache.
    pub(crate) fn poll(
        &self,
        ty: CalloutType,
        page: PageNum,
    ) -> (Option<Rc<dyn PageHandler>>, u32) {
        let mut first: Option<Rc<dyn PageHandler>> = None;
        let mut matches = 0u32;

        for obj in &self.buckets[ty.index()].slots {
            if !obj.installed {
                continue;
            }
            let Some(handler_fn) = obj.handler.as_ref() else {
                continue;
            };
            if !obj.matches_page(page) {
                continue;
            }
            if let Some(handler) = handler_fn(obj, page) {
                matches += 1;
                if first.is_none() {
                    first = Some(handler);
                } else {
                    break;
                }
            }
        }

        (first, matches)
    }
}

impl MemorySystem {
    /// Allocates a callout slot in `ty`'s bucket. Returns `None` when the
    /// bucket is full and cannot grow (pinned slots, or the safety bound).
    pub fn callout_allocate(&mut self, ty: CalloutType) -> Option<CalloutHandle> {
        match self.callouts.buckets[ty.index()].allocate() {
            Some(index) => Some(CalloutHandle { ty, index }),
            None => {
                warn!(?ty, "no free callout entries");
                None
            }
        }
    }

    /// Frees a callout slot, uninstalling it first if needed.
    pub fn callout_free(&mut self, handle: CalloutHandle) {
        if self.callouts.slot(handle).is_none() {
            return;
        }
        self.callout_uninstall(handle);
        let bucket = &mut self.callouts.buckets[handle.ty.index()];
        let slot = &mut bucket.slots[handle.index as usize];
        slot.allocated = false;
        slot.handler = None;
        if bucket.alloc_from > handle.index as usize {
            // An earlier slot just opened up; allocate from there next.
            bucket.alloc_from = handle.index as usize;
        }
    }

    /// Pins `handle`'s slot, preventing the bucket from being resized while
    /// the caller works with it. Returns false for a dead handle.
    pub fn callout_get(&mut self, handle: CalloutHandle) -> bool {
        match self.callouts.slot_mut(handle) {
            Some(slot) => {
                slot.getcounter += 1;
                true
            }
            None => false,
        }
    }

    /// Releases a pin taken with [`MemorySystem::callout_get`].
    pub fn callout_put(&mut self, handle: CalloutHandle) {
        if let Some(slot) = self.callouts.slot_mut(handle) {
            if slot.getcounter > 0 {
                slot.getcounter -= 1;
            }
        }
    }

    /// Installs a claim at `base_page` with `page_mask` and the claim
    /// function. A malformed mask (anything but high-zeros, middle-ones,
    /// low-zeros) or a misaligned base page logs an error and leaves the
    /// slot untouched. Installation invalidates every cached table slot the
    /// pattern could reach.
    pub fn callout_install(
        &mut self,
        handle: CalloutHandle,
        base_page: PageNum,
        page_mask: u32,
        handler: CalloutFn,
    ) -> bool {
        let Some(slot) = self.callouts.slot_mut(handle) else {
            return false;
        };
        if slot.installed {
            return false;
        }

        let Some((range_mask, alias_mask)) = derive_masks(page_mask) else {
            error!(page_mask, "invalid callout page mask");
            return false;
        };
        if (base_page & range_mask) != 0 {
            error!(
                base_page,
                page_mask, range_mask, "callout base page not aligned to its range"
            );
            return false;
        }

        slot.installed = true;
        slot.base_page = base_page;
        slot.page_mask = page_mask;
        slot.range_mask = range_mask;
        slot.alias_mask = alias_mask;
        slot.handler = Some(handler);

        debug!(
            base_page,
            page_mask, range_mask, alias_mask, "callout installed"
        );

        self.invalidate_callout_aliases(base_page, range_mask, alias_mask);
        self.flush_tlb();
        true
    }

    /// Uninstalls a claim, reverting every table slot it could have been
    /// cached into back to the slow path.
    pub fn callout_uninstall(&mut self, handle: CalloutHandle) {
        let Some(slot) = self.callouts.slot_mut(handle) else {
            return;
        };
        if !slot.installed {
            return;
        }
        slot.installed = false;
        let (base, range, alias) = (slot.base_page, slot.range_mask, slot.alias_mask);
        self.invalidate_callout_aliases(base, range, alias);
        self.flush_tlb();
    }

    /// Reverts the base range and all of its aliases to "ask the slow
    /// path".
    fn invalidate_callout_aliases(&mut self, base_page: PageNum, range_mask: u32, alias_mask: u32) {
        let mut page = base_page as u64;
        let step = alias_mask as u64 + 1;
        while page < self.core.handler_pages as u64 {
            self.invalidate_cached_handler(page as PageNum, range_mask + 1);
            page += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_derivation_splits_range_and_alias() {
        // 16-page device aliased every 1024 pages.
        let (range, alias) = derive_masks(0x3F0).unwrap();
        assert_eq!(range, 0x00F);
        assert_eq!(alias, 0x3FF);

        // Full decode, one page.
        let (range, alias) = derive_masks(MEMMASK_FULL).unwrap();
        assert_eq!(range, 0);
        assert_eq!(alias, MEMMASK_FULL);
    }

    #[test]
    fn mask_derivation_rejects_split_one_bands() {
        assert!(derive_masks(0).is_none());
        assert!(derive_masks(0x13F0).is_none());
        assert!(derive_masks(0x1000_0000).is_none());
    }

    #[test]
    fn memmask_range_covers_power_of_two_windows() {
        assert_eq!(memmask_range(1), MEMMASK_FULL);
        assert_eq!(memmask_range(16), MEMMASK_FULL & !0xF);
        assert_eq!(
            memmask_combine(MEMMASK_FULL, memmask_range(1024)),
            MEMMASK_FULL & !0x3FF
        );
    }
}
