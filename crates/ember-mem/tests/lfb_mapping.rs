use ember_mem::{MemCore, MemoryConfig, MemorySystem, PageFlags, PageHandler, PhysAddr};
use std::rc::Rc;

struct Marker(u8);

impl PageHandler for Marker {
    fn flags(&self) -> PageFlags {
        PageFlags::NOCODE
    }
    fn read8(&self, _core: &mut MemCore, _addr: PhysAddr) -> u8 {
        self.0
    }
    fn write8(&self, _core: &mut MemCore, _addr: PhysAddr, _val: u8) {}
}

fn mem(pcibus_enable: bool) -> MemorySystem {
    let mut mem = MemorySystem::new(MemoryConfig {
        memsize_mb: 4,
        address_bits: 32,
        pcibus_enable,
        ..MemoryConfig::default()
    })
    .unwrap();
    mem.a20_enable(true);
    mem
}

#[test]
fn lfb_and_mmio_resolve_through_callouts() {
    let mut mem = mem(true);
    let lfb: Rc<dyn PageHandler> = Rc::new(Marker(0x1F));
    let mmio: Rc<dyn PageHandler> = Rc::new(Marker(0x2F));

    // 4 MiB framebuffer at 16 MiB.
    mem.set_lfb(0x1000, 1024, Some(lfb), Some(mmio));

    assert_eq!(mem.read8(0x100_0000), 0x1F);
    assert_eq!(mem.read8(0x13F_FFFF), 0x1F);

    // The MMIO block sits 16 MiB above the LFB base, 16 pages long.
    assert_eq!(mem.read8(0x200_0000), 0x2F);
    assert_eq!(mem.read8(0x200_FFFF), 0x2F);
    assert_eq!(mem.read8(0x201_0000), 0xFF);

    // Between the LFB end and the MMIO block: nothing.
    assert_eq!(mem.read8(0x180_0000), 0xFF);
}

#[test]
fn lfb_moves_invalidate_the_old_window() {
    let mut mem = mem(true);
    let lfb: Rc<dyn PageHandler> = Rc::new(Marker(0x1F));

    mem.set_lfb(0x1000, 1024, Some(lfb.clone()), None);
    assert_eq!(mem.read8(0x100_0000), 0x1F);

    mem.set_lfb(0x2000, 1024, Some(lfb), None);
    assert_eq!(mem.read8(0x200_0000), 0x1F);
    assert_eq!(mem.read8(0x100_0000), 0xFF, "old window must unmap");
}

#[test]
fn lfb_disable_frees_the_window() {
    let mut mem = mem(true);
    let lfb: Rc<dyn PageHandler> = Rc::new(Marker(0x1F));

    mem.set_lfb(0x1000, 1024, Some(lfb), None);
    assert_eq!(mem.read8(0x100_0000), 0x1F);

    mem.set_lfb(0, 0, None, None);
    assert_eq!(mem.read8(0x100_0000), 0xFF);
}

#[test]
fn lfb_works_without_a_pci_bus() {
    let mut mem = mem(false);
    let lfb: Rc<dyn PageHandler> = Rc::new(Marker(0x3C));
    mem.set_lfb(0x1000, 256, Some(lfb), None);
    assert_eq!(mem.read8(0x100_0000), 0x3C);
    assert_eq!(mem.read8(0x110_0000), 0xFF);
}

#[test]
fn tlb_flushes_on_every_lfb_change() {
    let mut mem = mem(true);
    let flushes = std::rc::Rc::new(std::cell::Cell::new(0u32));
    let sink = flushes.clone();
    mem.set_tlb_sink(Box::new(move || sink.set(sink.get() + 1)));

    let lfb: Rc<dyn PageHandler> = Rc::new(Marker(0x1F));
    mem.set_lfb(0x1000, 1024, Some(lfb.clone()), None);
    assert!(flushes.get() > 0);

    let before = flushes.get();
    mem.set_lfb(0, 0, None, None);
    assert!(flushes.get() > before);

    // A redundant identical call is a no-op.
    let before = flushes.get();
    mem.set_lfb(0, 0, None, None);
    assert_eq!(flushes.get(), before);
}
