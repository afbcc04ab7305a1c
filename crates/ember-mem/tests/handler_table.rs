use ember_mem::{
    MapError, MemCore, MemoryConfig, MemorySystem, PageFlags, PageHandler, PhysAddr,
};
use std::cell::Cell;
use std::rc::Rc;

fn config(memsize_mb: u32) -> MemoryConfig {
    MemoryConfig {
        memsize_mb,
        address_bits: 36,
        ..MemoryConfig::default()
    }
}

fn mem(memsize_mb: u32) -> MemorySystem {
    MemorySystem::new(config(memsize_mb)).unwrap()
}

fn handler_eq(a: &Rc<dyn PageHandler>, b: &Rc<dyn PageHandler>) -> bool {
    Rc::ptr_eq(a, b)
}

#[test]
fn fresh_one_megabyte_machine_layout() {
    let mut mem = mem(1);
    assert_eq!(mem.total_pages(), 256);

    // Conventional RAM is pre-populated.
    let h0 = mem.get_handler(0);
    assert!(h0.flags().contains(PageFlags::READABLE | PageFlags::WRITEABLE));
    mem.write8(0x1000, 0x5A);
    assert_eq!(mem.read8(0x1000), 0x5A);

    // The adapter window starts unresolved and resolves to unmapped when no
    // device claims it.
    assert!(mem.cached_handler(0xA0).is_none());
    let h = mem.get_handler(0xA0);
    let mut probe = [0u8; 2];
    mem.block_read(0xA0000, &mut probe);
    assert_eq!(probe, [0xFF, 0xFF]);
    assert!(handler_eq(&h, &mem.get_handler(0xA0)));
    // ...and is now cached.
    assert!(mem.cached_handler(0xA0).is_some());

    // System BIOS pages are ROM from init.
    let rom = mem.get_handler(0xF0);
    assert!(rom.flags().contains(PageFlags::HASROM));
    mem.write8(0xF0000, 0x12);
    assert_eq!(mem.read8(0xF0000), 0x00, "ROM writes must be discarded");

    // Beyond both the handler table and the (absent) 4 GiB window.
    assert_eq!(mem.total_pages_4gb(), 0);
    let far = mem.get_handler(0x20_0000);
    assert_eq!(far.read8(mem.core_mut(), (0x20_0000u64) << 12), 0xFF);
}

#[test]
fn cached_slot_matches_get_handler() {
    let mut mem = mem(4);
    for page in [0u32, 0x50, 0xF0, 0x3FF] {
        let resolved = mem.get_handler(page);
        if let Some(cached) = mem.cached_handler(page) {
            assert!(handler_eq(&resolved, &cached), "page {page:#x}");
        }
    }
}

#[test]
fn unmapped_reads_float_high_and_drop_writes() {
    let mut mem = mem(4);
    // 4 MiB machine: page 0x400 and up is unmapped.
    assert_eq!(mem.read8(0x40_0000), 0xFF);
    assert_eq!(mem.read16(0x40_0000), 0xFFFF);
    assert_eq!(mem.read32(0x40_0000), 0xFFFF_FFFF);
    mem.write32(0x40_0000, 0x1234_5678);
    assert_eq!(mem.read32(0x40_0000), 0xFFFF_FFFF);
}

#[test]
fn map_helpers_respect_foreign_handlers() {
    struct DeviceRegs;
    impl PageHandler for DeviceRegs {
        fn flags(&self) -> PageFlags {
            PageFlags::NOCODE
        }
        fn read8(&self, _core: &mut MemCore, _addr: PhysAddr) -> u8 {
            0x42
        }
        fn write8(&self, _core: &mut MemCore, _addr: PhysAddr, _val: u8) {}
    }

    let mut mem = mem(4);
    let dev: Rc<dyn PageHandler> = Rc::new(DeviceRegs);
    mem.set_page_handler(0x300, 1, dev);

    // RAM cannot silently replace the device window...
    assert_eq!(
        mem.map_ram_physmem(0x30_0000, 0x30_0FFF),
        Err(MapError::HandlerConflict { page: 0x300 })
    );
    // ...but unmapping it and then mapping RAM is fine.
    mem.unmap_physmem(0x30_0000, 0x30_0FFF).unwrap();
    mem.map_ram_physmem(0x30_0000, 0x30_0FFF).unwrap();
    mem.write8(0x30_0000, 0xAB);
    assert_eq!(mem.read8(0x30_0000), 0xAB);

    // Re-mapping the same type over itself is idempotent.
    mem.map_ram_physmem(0x30_0000, 0x30_0FFF).unwrap();
}

#[test]
fn map_beyond_handler_pages_is_rejected() {
    let mut mem = MemorySystem::new(MemoryConfig {
        memsize_mb: 4,
        address_bits: 24,
        ..MemoryConfig::default()
    })
    .unwrap();
    // 24 address bits: the table covers 16 MiB.
    assert!(matches!(
        mem.map_rom_physmem(0x100_0000, 0x100_0FFF),
        Err(MapError::OutOfRange { .. })
    ));
}

#[test]
fn rom_alias_reads_the_bios_window() {
    let mut mem = mem(4);
    mem.a20_enable(true);
    mem.phys_write8(0xF1234, 0x9C);

    // The ROM alias refuses to overwrite live RAM...
    assert!(mem.map_rom_alias_physmem(0x10_0000, 0x10_FFFF).is_err());

    // ...but maps fine over the unmapped top-of-4GiB reset-vector window.
    mem.map_rom_alias_physmem(0xFFFF_0000, 0xFFFF_FFFF).unwrap();
    assert_eq!(mem.read8(0xFFFF_1234), 0x9C);
    mem.write8(0xFFFF_1234, 0x00);
    assert_eq!(mem.read8(0xFFFF_1234), 0x9C);
}

#[test]
fn every_mapping_mutation_flushes_the_tlb() {
    let mut mem = mem(4);
    let flushes = Rc::new(Cell::new(0u32));
    let sink = flushes.clone();
    mem.set_tlb_sink(Box::new(move || sink.set(sink.get() + 1)));

    let before = flushes.get();
    mem.unmap_physmem(0x30_0000, 0x30_0FFF).unwrap();
    assert!(flushes.get() > before);

    let before = flushes.get();
    mem.map_ram_physmem(0x30_0000, 0x30_0FFF).unwrap();
    assert!(flushes.get() > before);

    let before = flushes.get();
    mem.a20_enable(true);
    mem.a20_enable(false);
    assert!(flushes.get() > before);

    let before = flushes.get();
    mem.remove_ems_page_frame();
    assert!(flushes.get() > before);
}

#[test]
fn cut_ram_shrinks_reported_pages() {
    let mut mem = mem(4);
    assert_eq!(mem.total_pages(), 0x400);
    mem.cut_ram_up_to(0x20_0000);
    assert_eq!(mem.total_pages(), 0x200);
    // The vacated pages fall back to the slow path and resolve unmapped.
    assert_eq!(mem.read8(0x20_0000), 0xFF);
}

#[test]
fn ems_page_frame_restores_rom() {
    let mut mem = mem(4);
    mem.remove_ems_page_frame();
    let h = mem.get_handler(0xE0);
    assert!(h.flags().contains(PageFlags::HASROM));
}

#[test]
fn isa_memory_hole_blocks_ram() {
    let mut mem = MemorySystem::new(MemoryConfig {
        memsize_mb: 32,
        address_bits: 32,
        isa_memory_hole_15mb: true,
        ..MemoryConfig::default()
    })
    .unwrap();

    // 15 MiB..16 MiB resolves unmapped even though it is inside reported
    // RAM.
    assert_eq!(mem.read8(0xF0_0000), 0xFF);
    mem.write8(0xF0_0000, 0x33);
    assert_eq!(mem.read8(0xF0_0000), 0xFF);

    // The allocator never hands the hole out either.
    let handle = mem.allocate_pages(64, true);
    let mut h = handle;
    while h > 0 {
        assert!(!(0xF00..=0xFFF).contains(&h));
        h = mem.next_handle(h);
    }
}

#[test]
fn passthrough_window_short_circuits_the_table() {
    struct Lfb;
    impl PageHandler for Lfb {
        fn flags(&self) -> PageFlags {
            PageFlags::NOCODE
        }
        fn read8(&self, _core: &mut MemCore, _addr: PhysAddr) -> u8 {
            0x77
        }
        fn write8(&self, _core: &mut MemCore, _addr: PhysAddr, _val: u8) {}
    }

    let mut mem = mem(4);
    // Page 0x100 is ordinary RAM...
    mem.write8(0x10_0000, 0x10);
    assert_eq!(mem.read8(0x10_0000), 0x10);

    // ...until the passthrough window covers it.
    mem.set_passthrough_window(0x100, 16, Rc::new(Lfb));
    assert_eq!(mem.read8(0x10_0000), 0x77);

    mem.clear_passthrough_window();
    assert_eq!(mem.read8(0x10_0000), 0x10);
}

#[test]
fn acpi_window_maps_and_unmaps() {
    let mut mem = MemorySystem::new(MemoryConfig {
        memsize_mb: 16,
        address_bits: 32,
        ..MemoryConfig::default()
    })
    .unwrap();

    let base = 0xFEC0_0000u32;
    assert!(mem.acpi_init(base, 64 * 1024));
    mem.acpi_buffer_mut()[0] = 0xAC;
    mem.acpi_enable(true);

    assert_eq!(mem.read8(base), 0xAC);
    mem.write8(base + 1, 0x5F);
    assert_eq!(mem.read8(base + 1), 0x5F);

    mem.acpi_enable(false);
    assert_eq!(mem.read8(base), 0xFF);
}

#[test]
fn acpi_rejects_bad_regions() {
    let mut mem = mem(4);
    assert!(!mem.acpi_init(0xFEC0_0000, 0));
    assert!(!mem.acpi_init(0xFEC0_0000, 3 * 4096));
    assert!(!mem.acpi_init(0xFEC0_0000, 16 << 20));
}
