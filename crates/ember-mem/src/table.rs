//! The page-indexed handler table, its slow-path resolution, and the
//! physical-memory map helpers.
//!
//! A table slot is either a cached handler or `None`, meaning "ask the slow
//! path". The slow path polls the callout registry (motherboard, then PCI
//! when the PCI bus is enabled, then ISA) and caches the result back into
//! the slot whenever at most one device claimed the page. With two or more
//! claimants the slot stays uncached so every access re-polls; returning
//! the first claimant without write-broadcast is a known limitation kept
//! until devices grow broadcast support.

use crate::callout::CalloutType;
use crate::handler::PageHandler;
use crate::{MemorySystem, PageNum, PassthroughWindow, PhysAddr, PAGE_4GB, PAGE_SHIFT, PAGE_SIZE};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("pages 0x{start:x}-0x{end:x} beyond handler page limit 0x{handler_pages:x}")]
    OutOfRange {
        start: PageNum,
        end: PageNum,
        handler_pages: u32,
    },
    #[error("page 0x{page:x} already owned by another device handler")]
    HandlerConflict { page: PageNum },
}

pub(crate) struct HandlerTable {
    pub(crate) slots: Vec<Option<Rc<dyn PageHandler>>>,
}

impl HandlerTable {
    pub(crate) fn new(handler_pages: u32) -> HandlerTable {
        HandlerTable {
            slots: vec![None; handler_pages as usize],
        }
    }
}

impl MemorySystem {
    /// Resolves the handler for a physical page.
    ///
    /// The page is reduced through the active alias mask first, so callers
    /// can pass raw page numbers. Pages beyond the table either fall into
    /// the above-4 GiB file window or resolve to the illegal handler.
    pub fn get_handler(&mut self, page: PageNum) -> Rc<dyn PageHandler> {
        let page = page & self.core.alias_pagemask_active;

        if let Some(pt) = &self.passthrough {
            if page >= pt.base_page && page < pt.base_page + pt.pages {
                return pt.handler.clone();
            }
        }

        if page < self.core.handler_pages {
            if let Some(handler) = &self.table.slots[page as usize] {
                return handler.clone();
            }
            return self.slow_path(page);
        }

        if page >= PAGE_4GB && page < PAGE_4GB + self.core.reported_pages_4gb {
            return self.builtins.high_ram.clone();
        }

        self.builtins.illegal.clone()
    }

    /// Reads a cached slot without triggering resolution.
    pub fn cached_handler(&self, page: PageNum) -> Option<Rc<dyn PageHandler>> {
        self.table
            .slots
            .get((page & self.core.alias_pagemask_active) as usize)?
            .clone()
    }

    /// Legacy adapter space and the ISA 15 MiB hole: reported RAM does not
    /// imply a RAM mapping here, devices claim these pages explicitly.
    fn in_device_hole(&self, page: PageNum) -> bool {
        if (0xA0..0x100).contains(&page) {
            return true;
        }
        self.core.isa_memory_hole_15mb && (0xF00..=0xFFF).contains(&page)
    }

    fn slow_path(&mut self, page: PageNum) -> Rc<dyn PageHandler> {
        if page >= self.core.handler_pages {
            return self.builtins.illegal.clone();
        }

        let mut resolved = self.builtins.unmapped.clone();

        if page < self.core.reported_pages && !self.in_device_hole(page) {
            // RAM pages are pre-populated at init; reaching the slow path
            // here means something invalidated a plain RAM slot.
            warn!(page, "slow path hit inside reported system RAM");
            resolved = self.builtins.ram.clone();
        }

        // Motherboard devices answer first, then the buses.
        let (mut handler, mut matches) = self.callouts.poll(CalloutType::Motherboard, page);
        if matches == 0 {
            if self.pcibus_enable {
                (handler, matches) = self.callouts.poll(CalloutType::Pci, page);
                if matches == 0 {
                    (handler, matches) = self.callouts.poll(CalloutType::Isa, page);
                }
            } else {
                (handler, matches) = self.callouts.poll(CalloutType::Isa, page);
            }
        }

        if let Some(handler) = handler {
            resolved = handler;
        }

        debug!(page, matches, "memory slow path");

        // Cache unless the page is contested; a contested page re-polls on
        // every access.
        if matches <= 1 {
            self.table.slots[page as usize] = Some(resolved.clone());
        }

        resolved
    }

    /// Installs `handler` over a page range, bypassing the callout system.
    pub fn set_page_handler(&mut self, first_page: PageNum, pages: u32, handler: Rc<dyn PageHandler>) {
        for page in first_page..first_page + pages {
            self.table.slots[page as usize] = Some(handler.clone());
        }
    }

    /// Reverts a page range to the RAM handler.
    pub fn reset_page_handler_ram(&mut self, first_page: PageNum, pages: u32) {
        let ram = self.builtins.ram.clone();
        self.set_page_handler(first_page, pages, ram);
    }

    /// Reverts a page range to the unmapped handler.
    pub fn reset_page_handler_unmapped(&mut self, first_page: PageNum, pages: u32) {
        let unmapped = self.builtins.unmapped.clone();
        self.set_page_handler(first_page, pages, unmapped);
    }

    /// Clears cached slots back to "ask the slow path".
    pub fn invalidate_cached_handler(&mut self, first_page: PageNum, pages: u32) {
        let end = (first_page + pages).min(self.core.handler_pages);
        for page in first_page..end {
            self.table.slots[page as usize] = None;
        }
    }

    /// Alias of [`MemorySystem::invalidate_cached_handler`] for device
    /// teardown.
    pub fn free_page_handler(&mut self, first_page: PageNum, pages: u32) {
        self.invalidate_cached_handler(first_page, pages);
    }

    fn physmem_range(&self, start: PhysAddr, end: PhysAddr) -> Result<(PageNum, PageNum), MapError> {
        if (start & 0xFFF) != 0 {
            warn!(start, "physmem map start not page aligned");
        }
        if (end & 0xFFF) != 0xFFF {
            warn!(end, "physmem map end not page aligned");
        }
        let start = (start >> PAGE_SHIFT) as PageNum;
        let end = (end >> PAGE_SHIFT) as PageNum;
        if start >= self.core.handler_pages || end >= self.core.handler_pages {
            return Err(MapError::OutOfRange {
                start,
                end,
                handler_pages: self.core.handler_pages,
            });
        }
        Ok((start, end))
    }

    /// Whether `page`'s slot may be replaced when installing `target`
    /// (nil, illegal, unmapped, or already the target type).
    fn slot_replaceable(&self, page: PageNum, target: Option<&Rc<dyn PageHandler>>) -> bool {
        match &self.table.slots[page as usize] {
            None => true,
            Some(current) => {
                Rc::ptr_eq(current, &self.builtins.illegal)
                    || Rc::ptr_eq(current, &self.builtins.unmapped)
                    || target.is_some_and(|t| Rc::ptr_eq(current, t))
            }
        }
    }

    /// Unmaps `[start, end]` (inclusive byte addresses): reads float high,
    /// writes drop.
    pub fn unmap_physmem(&mut self, start: PhysAddr, end: PhysAddr) -> Result<(), MapError> {
        let (start, end) = self.physmem_range(start, end)?;
        let unmapped = self.builtins.unmapped.clone();
        for page in start..=end {
            self.table.slots[page as usize] = Some(unmapped.clone());
        }
        self.flush_tlb();
        Ok(())
    }

    fn map_physmem_as(
        &mut self,
        start: PhysAddr,
        end: PhysAddr,
        target: Rc<dyn PageHandler>,
        exact_match_only: bool,
    ) -> Result<(), MapError> {
        let (start, end) = self.physmem_range(start, end)?;

        for page in start..=end {
            let same = if exact_match_only { Some(&target) } else { None };
            if !self.slot_replaceable(page, same) {
                return Err(MapError::HandlerConflict { page });
            }
        }

        for page in start..=end {
            self.table.slots[page as usize] = Some(target.clone());
        }
        self.flush_tlb();
        Ok(())
    }

    /// Maps `[start, end]` as plain RAM. Refuses to overwrite a foreign
    /// device's handler.
    pub fn map_ram_physmem(&mut self, start: PhysAddr, end: PhysAddr) -> Result<(), MapError> {
        let ram = self.builtins.ram.clone();
        self.map_physmem_as(start, end, ram, true)
    }

    /// Maps `[start, end]` as ROM.
    pub fn map_rom_physmem(&mut self, start: PhysAddr, end: PhysAddr) -> Result<(), MapError> {
        let rom = self.builtins.rom.clone();
        self.map_physmem_as(start, end, rom, true)
    }

    /// Maps `[start, end]` as the 64 KiB system-BIOS alias.
    pub fn map_rom_alias_physmem(&mut self, start: PhysAddr, end: PhysAddr) -> Result<(), MapError> {
        let alias = self.builtins.rom_alias.clone();
        self.map_physmem_as(start, end, alias, false)
    }

    /// Remaps the EMS page-frame window back to ROM once the page frame is
    /// torn down (`0xD0000` window on PC-98, `0xE0000` on PC/AT).
    pub fn remove_ems_page_frame(&mut self) {
        debug!("removing EMS page frame");
        let range = match self.core.machine {
            crate::MachineProfile::Pc98 => 0xD0..0xE0,
            crate::MachineProfile::PcAt => 0xE0..0xF0,
        };
        let rom = self.builtins.rom.clone();
        for page in range {
            self.table.slots[page as usize] = Some(rom.clone());
        }
        self.flush_tlb();
    }

    /// Routes a fixed window to `handler` ahead of the handler table
    /// (3dfx-style framebuffer passthrough).
    pub fn set_passthrough_window(
        &mut self,
        base_page: PageNum,
        pages: u32,
        handler: Rc<dyn PageHandler>,
    ) {
        self.passthrough = Some(PassthroughWindow {
            base_page,
            pages,
            handler,
        });
        self.flush_tlb();
    }

    pub fn clear_passthrough_window(&mut self) {
        if self.passthrough.take().is_some() {
            self.flush_tlb();
        }
    }

    /// Allocates the ACPI table buffer. `region_size` must be a non-zero
    /// power of two no larger than 8 MiB.
    pub fn acpi_init(&mut self, base: u32, region_size: u32) -> bool {
        if region_size == 0
            || region_size > (8 << 20)
            || !region_size.is_power_of_two()
            || (base & 0xFFF) != 0
        {
            return false;
        }
        if self.core.acpi.buffer.is_empty() {
            self.core.acpi.buffer = vec![0u8; region_size as usize];
        }
        self.core.acpi.base = base;
        self.core.acpi.region_size = region_size;
        true
    }

    /// Maps or unmaps the ACPI window over its configured region.
    pub fn acpi_enable(&mut self, enable: bool) {
        if self.core.acpi.base == 0 || self.core.acpi.region_size == 0 {
            return;
        }
        let first = self.core.acpi.base >> PAGE_SHIFT;
        let pages = self.core.acpi.region_size / PAGE_SIZE as u32;
        if enable && !self.core.acpi.enabled {
            let acpi = self.builtins.acpi.clone();
            self.set_page_handler(first, pages, acpi);
            self.core.acpi.enabled = true;
            self.flush_tlb();
        } else if !enable && self.core.acpi.enabled {
            self.reset_page_handler_unmapped(first, pages);
            self.core.acpi.enabled = false;
            self.flush_tlb();
        }
    }

    pub fn acpi_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.core.acpi.buffer
    }

    pub fn acpi_free(&mut self) {
        self.acpi_enable(false);
        self.core.acpi.buffer = Vec::new();
        self.core.acpi.region_size = 0;
    }
}
