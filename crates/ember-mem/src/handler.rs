//! Page handler contract and the built-in handlers.
//!
//! Every 4 KiB guest physical page is serviced by a [`PageHandler`]. The
//! handler either discloses a host slice for the page (RAM-like pages,
//! advertised through [`PageFlags::READABLE`] / [`PageFlags::WRITEABLE`] so
//! the CPU's TLB can bypass the callback path), or services each access
//! through the byte/word callbacks (device MMIO).
//!
//! Handlers are immutable and shared: the built-ins here are process-wide
//! singletons held as `Rc<dyn PageHandler>`, and device handlers are owned
//! by their device. Backing state is not captured inside the handler;
//! instead the shared [`MemCore`] context is passed into every call, which
//! keeps the handler graph free of cycles.

use crate::a20::A20State;
use crate::backing::RamStore;
use crate::config::MachineProfile;
use crate::{PageNum, PhysAddr, PAGE_4GB, PAGE_SHIFT, PAGE_SIZE};
use bitflags::bitflags;
use std::cell::Cell;
use std::rc::Rc;
use tracing::{error, warn};

bitflags! {
    /// Capability bits inspected by the CPU's TLB shortcut.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// `host_read_page` returns a valid slice for this page.
        const READABLE = 1 << 0;
        /// `host_write_page` returns a valid slice for this page.
        const WRITEABLE = 1 << 1;
        /// Reads hit ROM; the page must not be treated as ordinary RAM.
        const HASROM = 1 << 2;
        /// The dynamic core must not translate code out of this page.
        const NOCODE = 1 << 3;
        /// Placeholder mapping installed at init time.
        const INIT = 1 << 4;
    }
}

/// Shared memory context handed to every handler call: the backing store,
/// the ACPI table buffer and the alias/A20 state.
pub struct MemCore {
    pub(crate) store: RamStore,
    pub(crate) acpi: AcpiRegion,
    pub(crate) a20: A20State,

    pub(crate) machine: MachineProfile,
    pub(crate) isa_memory_hole_15mb: bool,

    /// Pages of backing store below 4 GiB (never less than 1 MiB worth).
    pub(crate) pages: u32,
    /// Pages reported to the guest OS.
    pub(crate) reported_pages: u32,
    /// File-backed pages above the 4 GiB boundary.
    pub(crate) reported_pages_4gb: u32,
    /// Size of the handler table.
    pub(crate) handler_pages: u32,

    pub(crate) address_bits: u32,
    pub(crate) alias_pagemask: u32,
    pub(crate) alias_pagemask_active: u32,
}

impl MemCore {
    pub fn store(&self) -> &RamStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RamStore {
        &mut self.store
    }

    pub fn reported_pages(&self) -> u32 {
        self.reported_pages
    }

    pub fn alias_pagemask_active(&self) -> u32 {
        self.alias_pagemask_active
    }

    /// Backing page a RAM access to `page` resolves to.
    ///
    /// In fast-A20 mode the alias mask is only consulted inside the
    /// 1 MiB..1 MiB+64 KiB wraparound band; everywhere else the page maps
    /// straight through, so A20 flips need no TLB invalidation for those
    /// pages.
    pub fn ram_backing_page(&self, page: PageNum) -> PageNum {
        if !self.a20.fast_changeable || (page & !0xF) == 0x100 {
            page & self.alias_pagemask_active
        } else {
            page
        }
    }
}

/// ACPI table window state. The buffer wraps across the configured
/// power-of-two region; pages past the buffer end clamp to the last page.
pub(crate) struct AcpiRegion {
    pub(crate) buffer: Vec<u8>,
    pub(crate) base: u32,
    pub(crate) region_size: u32,
    pub(crate) enabled: bool,
}

impl AcpiRegion {
    pub(crate) fn empty() -> AcpiRegion {
        AcpiRegion {
            buffer: Vec::new(),
            base: 0,
            region_size: 0,
            enabled: false,
        }
    }

    fn buffer_page(&self, page: PageNum) -> Option<u32> {
        if self.buffer.is_empty() || self.region_size == 0 {
            return None;
        }
        let mut p = page.wrapping_sub(self.base >> PAGE_SHIFT);
        p &= (self.region_size >> PAGE_SHIFT) - 1;
        let buffer_pages = (self.buffer.len() >> PAGE_SHIFT) as u32;
        if p >= buffer_pages {
            p = buffer_pages - 1;
        }
        Some(p)
    }
}

/// Per-page access dispatch.
///
/// Unaligned 16/32-bit accesses that straddle a page boundary are the
/// caller's responsibility; the default word methods compose byte accesses
/// within whatever page the handler was resolved for.
pub trait PageHandler {
    fn flags(&self) -> PageFlags;

    /// Host slice for reads of `page`, when [`PageFlags::READABLE`] is set.
    fn host_read_page<'m>(&self, _core: &'m MemCore, _page: PageNum) -> Option<&'m [u8]> {
        None
    }

    /// Host slice for writes to `page`, when [`PageFlags::WRITEABLE`] is set.
    fn host_write_page<'m>(&self, _core: &'m mut MemCore, _page: PageNum) -> Option<&'m mut [u8]> {
        None
    }

    fn read8(&self, core: &mut MemCore, addr: PhysAddr) -> u8 {
        let page = (addr >> PAGE_SHIFT) as PageNum;
        match self.host_read_page(core, page) {
            Some(slice) => slice[(addr & 0xFFF) as usize],
            // Open bus: real hardware returns 0xFF, not 0x00.
            None => 0xFF,
        }
    }

    fn write8(&self, core: &mut MemCore, addr: PhysAddr, val: u8) {
        let page = (addr >> PAGE_SHIFT) as PageNum;
        if let Some(slice) = self.host_write_page(core, page) {
            slice[(addr & 0xFFF) as usize] = val;
        }
    }

    fn read16(&self, core: &mut MemCore, addr: PhysAddr) -> u16 {
        u16::from(self.read8(core, addr)) | u16::from(self.read8(core, addr + 1)) << 8
    }

    fn write16(&self, core: &mut MemCore, addr: PhysAddr, val: u16) {
        self.write8(core, addr, val as u8);
        self.write8(core, addr + 1, (val >> 8) as u8);
    }

    fn read32(&self, core: &mut MemCore, addr: PhysAddr) -> u32 {
        u32::from(self.read16(core, addr)) | u32::from(self.read16(core, addr + 2)) << 16
    }

    fn write32(&self, core: &mut MemCore, addr: PhysAddr, val: u32) {
        self.write16(core, addr, val as u16);
        self.write16(core, addr + 2, (val >> 16) as u16);
    }
}

/// Ordinary guest RAM, subject to the A20/alias page mask.
pub(crate) struct RamPage;

impl PageHandler for RamPage {
    fn flags(&self) -> PageFlags {
        PageFlags::READABLE | PageFlags::WRITEABLE
    }

    fn host_read_page<'m>(&self, core: &'m MemCore, page: PageNum) -> Option<&'m [u8]> {
        let backing = core.ram_backing_page(page);
        core.store.page(backing)
    }

    fn host_write_page<'m>(&self, core: &'m mut MemCore, page: PageNum) -> Option<&'m mut [u8]> {
        let backing = core.ram_backing_page(page);
        core.store.page_mut(backing)
    }
}

/// ROM: reads come from the backing store like RAM, writes are discarded
/// with an error log.
///
/// On PC-98 the `0xE0000-0xE7FFF` fourth-bitplane aperture is exempt from
/// the log: much software zeroes that range whether or not the plane is
/// mapped.
pub(crate) struct RomPage;

impl RomPage {
    fn log_write(&self, core: &MemCore, addr: PhysAddr, val: u32) {
        if core.machine == MachineProfile::Pc98 && (addr & !0x7FFF) == 0xE0000 {
            return;
        }
        error!(addr, val, "write to ROM discarded");
    }
}

impl PageHandler for RomPage {
    fn flags(&self) -> PageFlags {
        PageFlags::READABLE | PageFlags::HASROM
    }

    fn host_read_page<'m>(&self, core: &'m MemCore, page: PageNum) -> Option<&'m [u8]> {
        let backing = core.ram_backing_page(page);
        core.store.page(backing)
    }

    fn write8(&self, core: &mut MemCore, addr: PhysAddr, val: u8) {
        self.log_write(core, addr, val.into());
    }

    fn write16(&self, core: &mut MemCore, addr: PhysAddr, val: u16) {
        self.log_write(core, addr, val.into());
    }

    fn write32(&self, core: &mut MemCore, addr: PhysAddr, val: u32) {
        self.log_write(core, addr, val);
    }
}

/// 64 KiB ROM alias: the low four page bits select into the system BIOS
/// area at `0xF0000`.
pub(crate) struct RomAliasPage;

impl PageHandler for RomAliasPage {
    fn flags(&self) -> PageFlags {
        PageFlags::READABLE | PageFlags::HASROM
    }

    fn host_read_page<'m>(&self, core: &'m MemCore, page: PageNum) -> Option<&'m [u8]> {
        core.store.page(0xF0 + (page & 0xF))
    }

    fn write8(&self, _core: &mut MemCore, addr: PhysAddr, val: u8) {
        error!(addr, val, "write to ROM alias discarded");
    }
}

/// A page no device claimed: reads float high, writes vanish.
pub(crate) struct UnmappedPage;

impl PageHandler for UnmappedPage {
    fn flags(&self) -> PageFlags {
        PageFlags::INIT | PageFlags::NOCODE
    }

    fn read8(&self, _core: &mut MemCore, _addr: PhysAddr) -> u8 {
        0xFF
    }

    fn write8(&self, _core: &mut MemCore, _addr: PhysAddr, _val: u8) {}
}

/// A page outside the handler table entirely. Same data contract as
/// [`UnmappedPage`], but the access is logged (rate-limited so a guest
/// scanning the bus cannot flood the log).
pub(crate) struct IllegalPage {
    logged: Cell<u32>,
}

const ILLEGAL_LOG_LIMIT: u32 = 1000;

impl IllegalPage {
    pub(crate) fn new() -> IllegalPage {
        IllegalPage {
            logged: Cell::new(0),
        }
    }

    fn log(&self, what: &str, addr: PhysAddr) {
        let n = self.logged.get();
        if n < ILLEGAL_LOG_LIMIT {
            self.logged.set(n + 1);
            warn!(addr, "illegal {what}");
        }
    }
}

impl PageHandler for IllegalPage {
    fn flags(&self) -> PageFlags {
        PageFlags::INIT | PageFlags::NOCODE
    }

    fn read8(&self, _core: &mut MemCore, addr: PhysAddr) -> u8 {
        self.log("read", addr);
        0xFF
    }

    fn write8(&self, _core: &mut MemCore, addr: PhysAddr, _val: u8) {
        self.log("write", addr);
    }
}

/// ACPI table window.
pub(crate) struct AcpiPage;

impl PageHandler for AcpiPage {
    fn flags(&self) -> PageFlags {
        PageFlags::NOCODE | PageFlags::READABLE | PageFlags::WRITEABLE
    }

    fn host_read_page<'m>(&self, core: &'m MemCore, page: PageNum) -> Option<&'m [u8]> {
        let p = core.acpi.buffer_page(page)?;
        let ofs = (p as usize) << PAGE_SHIFT;
        Some(&core.acpi.buffer[ofs..ofs + PAGE_SIZE])
    }

    fn host_write_page<'m>(&self, core: &'m mut MemCore, page: PageNum) -> Option<&'m mut [u8]> {
        let p = core.acpi.buffer_page(page)?;
        let ofs = (p as usize) << PAGE_SHIFT;
        Some(&mut core.acpi.buffer[ofs..ofs + PAGE_SIZE])
    }
}

/// File-backed RAM above the 4 GiB boundary. Page numbers translate to the
/// high region by subtracting `0x100000`.
pub(crate) struct HighRamPage;

impl PageHandler for HighRamPage {
    fn flags(&self) -> PageFlags {
        PageFlags::READABLE | PageFlags::WRITEABLE
    }

    fn host_read_page<'m>(&self, core: &'m MemCore, page: PageNum) -> Option<&'m [u8]> {
        core.store.high_page(page.wrapping_sub(PAGE_4GB))
    }

    fn host_write_page<'m>(&self, core: &'m mut MemCore, page: PageNum) -> Option<&'m mut [u8]> {
        core.store.high_page_mut(page.wrapping_sub(PAGE_4GB))
    }
}

/// The built-in handler singletons, installed into table slots by page
/// number and compared by identity (`Rc::ptr_eq`) everywhere else.
pub(crate) struct Builtins {
    pub(crate) ram: Rc<dyn PageHandler>,
    pub(crate) rom: Rc<dyn PageHandler>,
    pub(crate) rom_alias: Rc<dyn PageHandler>,
    pub(crate) unmapped: Rc<dyn PageHandler>,
    pub(crate) illegal: Rc<dyn PageHandler>,
    pub(crate) acpi: Rc<dyn PageHandler>,
    pub(crate) high_ram: Rc<dyn PageHandler>,
}

impl Builtins {
    pub(crate) fn new() -> Builtins {
        Builtins {
            ram: Rc::new(RamPage),
            rom: Rc::new(RomPage),
            rom_alias: Rc::new(RomAliasPage),
            unmapped: Rc::new(UnmappedPage),
            illegal: Rc::new(IllegalPage::new()),
            acpi: Rc::new(AcpiPage),
            high_ram: Rc::new(HighRamPage),
        }
    }
}
