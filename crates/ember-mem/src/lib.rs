//! Guest physical memory for the ember PC emulator.
//!
//! This crate owns everything between the CPU's paging layer and the
//! emulated devices: the RAM backing store (heap or file mapping), the
//! per-page handler dispatch table with lazy device callout resolution, the
//! A20 gate and address-line alias masking, the EMS/XMS page handle
//! allocator, the linear framebuffer mapper and the block I/O helpers.
//!
//! All state lives in a single owned [`MemorySystem`] value; devices share
//! it as a [`SharedMemorySystem`]. The subsystem is single-threaded
//! cooperative: any device may hold a host slice obtained through a page
//! handler while it runs, trusting the scheduler for atomicity.
//!
//! The CPU's TLB is an external collaborator. Every operation that changes
//! the page mapping (handler table writes, callout installs, A20 flips, LFB
//! moves) invokes the flush sink registered with
//! [`MemorySystem::set_tlb_sink`] before returning, so the paging layer
//! never services an access against a stale mapping.

mod a20;
mod alloc;
mod backing;
mod block;
mod callout;
mod config;
mod handler;
mod hw_assign;
mod lfb;
mod snapshot;
mod table;

pub use a20::A20Mode;
pub use backing::BackingError;
pub use callout::{
    memmask_combine, memmask_range, CalloutFn, CalloutHandle, CalloutObject, CalloutType,
    MEMMASK_FULL, MEMMASK_ISA_24BIT,
};
pub use config::{ConfigError, CpuKind, MachineProfile, MemoryConfig};
pub use handler::{MemCore, PageFlags, PageHandler};
pub use snapshot::{MemorySnapshot, RestoreError, WellKnownHandler};
pub use table::MapError;

use callout::CalloutRegistry;
use handler::Builtins;
use lfb::LfbRecords;
use std::cell::RefCell;
use std::rc::Rc;
use table::HandlerTable;
use tracing::debug;

/// Size of one guest physical page.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// First page number eligible for the EMS/XMS handle allocator
/// (1 MiB + 64 KiB, above the real-mode HMA).
pub const XMS_START: PageNum = 0x110;

/// First page of the above-4 GiB file-backed RAM window.
pub const PAGE_4GB: PageNum = 0x10_0000;

/// Index of a 4 KiB guest physical page. Addresses up to 40 bits are
/// supported, so page numbers fit 28 bits.
pub type PageNum = u32;

/// A full guest physical address (up to 40 bits).
pub type PhysAddr = u64;

/// A linear address as handed down by the CPU core (32-bit).
pub type LinearAddr = u32;

/// EMS/XMS allocation handle: the first page of a chain, `0` for "no
/// handle", `-1` as the chain terminator inside the handle array.
pub type MemHandle = i32;

pub type SharedMemorySystem = Rc<RefCell<MemorySystem>>;

/// A fixed window routed to one handler ahead of the handler table
/// (3dfx-style direct framebuffer passthrough).
pub(crate) struct PassthroughWindow {
    pub(crate) base_page: PageNum,
    pub(crate) pages: u32,
    pub(crate) handler: Rc<dyn PageHandler>,
}

/// The guest physical memory subsystem.
///
/// Constructed once per machine from a [`MemoryConfig`]; every public
/// operation takes it as the explicit receiver.
pub struct MemorySystem {
    pub(crate) core: MemCore,
    pub(crate) table: HandlerTable,
    pub(crate) callouts: CalloutRegistry,
    pub(crate) builtins: Builtins,

    pub(crate) lfb: Rc<RefCell<LfbRecords>>,
    pub(crate) lfb_cb: Option<CalloutHandle>,
    pub(crate) lfb_mmio_cb: Option<CalloutHandle>,
    pub(crate) passthrough: Option<PassthroughWindow>,

    pub(crate) mhandles: Vec<MemHandle>,
    pub(crate) hw_next_assign: u32,
    pub(crate) pcibus_enable: bool,

    pub(crate) vga_handlers: [Option<Rc<dyn PageHandler>>; 16],

    pub(crate) cfg: MemoryConfig,
    tlb_sink: Option<Box<dyn FnMut()>>,
}

impl MemorySystem {
    pub fn into_shared(self) -> SharedMemorySystem {
        Rc::new(RefCell::new(self))
    }

    /// Registers the callback invoked whenever the page mapping changes.
    ///
    /// The paging layer must clear its TLB from this callback; until it is
    /// registered, mapping changes are assumed to precede the first guest
    /// instruction.
    pub fn set_tlb_sink(&mut self, sink: Box<dyn FnMut()>) {
        self.tlb_sink = Some(sink);
    }

    pub(crate) fn flush_tlb(&mut self) {
        if let Some(sink) = self.tlb_sink.as_mut() {
            sink();
        }
    }

    /// Total pages of RAM reported to the guest OS (below 4 GiB).
    pub fn total_pages(&self) -> u32 {
        self.core.reported_pages
    }

    /// Pages of file-backed RAM above the 4 GiB boundary.
    pub fn total_pages_4gb(&self) -> u32 {
        self.core.reported_pages_4gb
    }

    pub fn address_bits(&self) -> u32 {
        self.core.address_bits
    }

    /// Address bits clamped to 32 for callers that cannot handle more.
    pub fn address_bits_4gb(&self) -> u32 {
        self.core.address_bits.min(32)
    }

    pub fn page_mask(&self) -> u32 {
        self.core.alias_pagemask
    }

    pub fn page_mask_active(&self) -> u32 {
        self.core.alias_pagemask_active
    }

    pub fn machine(&self) -> MachineProfile {
        self.core.machine
    }

    pub fn isa_memory_hole_15mb(&self) -> bool {
        self.core.isa_memory_hole_15mb
    }

    pub fn core(&self) -> &MemCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut MemCore {
        &mut self.core
    }

    /// Registers a VGA page handler in the well-known save-state table.
    ///
    /// `slot` is the video subsystem's handler index (0..16).
    pub fn register_vga_handler(&mut self, slot: usize, handler: Rc<dyn PageHandler>) {
        self.vga_handlers[slot] = Some(handler);
    }

    /// ROM-BIOS-imposed cap: shrink reported RAM so the upper ROM alias has
    /// room, clearing the vacated handler slots back to the slow path.
    pub fn cut_ram_up_to(&mut self, addr: PhysAddr) {
        let pages = (addr >> PAGE_SHIFT) as u32;
        if self.core.reported_pages > pages {
            debug!(addr, "reducing reported RAM");
            while self.core.reported_pages > pages {
                self.core.reported_pages -= 1;
                self.table.slots[self.core.reported_pages as usize] = None;
            }
            self.flush_tlb();
        }
    }
}
