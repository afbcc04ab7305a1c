use ember_mem::{A20Mode, MachineProfile, MemoryConfig};
use ember_pc::PcPlatform;
use ember_platform::reset::CpuRedirect;

fn pc_at(memsize_mb: u32) -> PcPlatform {
    PcPlatform::new(MemoryConfig {
        memsize_mb,
        address_bits: 32,
        a20: A20Mode::Mask,
        ..MemoryConfig::default()
    })
    .unwrap()
}

fn pc98(memsize_mb: u32, isa_hole: bool) -> PcPlatform {
    PcPlatform::new(MemoryConfig {
        memsize_mb,
        address_bits: 32,
        machine: MachineProfile::Pc98,
        isa_memory_hole_15mb: isa_hole,
        ..MemoryConfig::default()
    })
    .unwrap()
}

#[test]
fn port_92_drives_the_a20_gate_and_memory_aliasing() {
    let mut pc = pc_at(4);

    // Reset default: A20 masked, 1 MiB wraps.
    assert_eq!(pc.io.read_u8(0x92) & 0x02, 0x00);
    pc.mem.borrow_mut().write8(0x0, 0x11);
    assert_eq!(pc.mem.borrow_mut().read8(0x10_0000), 0x11);

    // Enable A20 through port 92h bit 1.
    pc.io.write_u8(0x92, 0x02);
    assert!(pc.mem.borrow().a20_enabled());
    assert_eq!(pc.io.read_u8(0x92) & 0x02, 0x02);

    pc.mem.borrow_mut().write8(0x10_0000, 0x22);
    assert_eq!(pc.mem.borrow_mut().read8(0x0), 0x11);
    assert_eq!(pc.mem.borrow_mut().read8(0x10_0000), 0x22);

    // Disable again: the alias returns.
    pc.io.write_u8(0x92, 0x00);
    assert!(!pc.mem.borrow().a20_enabled());
    assert_eq!(pc.mem.borrow_mut().read8(0x10_0000), 0x11);
}

#[test]
fn port_92_bit0_requests_a_cpu_reset() {
    let mut pc = pc_at(4);
    assert!(!pc.redirect.is_pending());

    // Bit 0 with the default shutdown byte: full reboot, and the A20 bit in
    // the same write is still honoured.
    pc.io.write_u8(0x92, 0x03);
    assert!(pc.mem.borrow().a20_enabled());
    assert_eq!(pc.redirect.take(), Some(CpuRedirect::FullReboot));
}

#[test]
fn shutdown_byte_selects_the_reset_vector_path() {
    let mut pc = pc_at(4);

    {
        let mut mem = pc.mem.borrow_mut();
        mem.phys_write16(0x400 + 0x67, 0x5678);
        mem.phys_write16(0x400 + 0x69, 0x1234);
    }
    pc.shutdown.set(0x0A);
    pc.io.write_u8(0x92, 0x01);

    assert_eq!(
        pc.redirect.take(),
        Some(CpuRedirect::JumpResetVector {
            seg: 0x1234,
            offset: 0x5678,
            send_eoi: false,
        })
    );
}

#[test]
fn port_92_reset_can_be_disallowed() {
    let mut pc = PcPlatform::new(MemoryConfig {
        memsize_mb: 4,
        allow_port92_reset: false,
        ..MemoryConfig::default()
    })
    .unwrap();

    pc.io.write_u8(0x92, 0x01);
    assert!(!pc.redirect.is_pending());
}

#[test]
fn port_92_can_be_left_uninstalled() {
    let mut pc = PcPlatform::new(MemoryConfig {
        memsize_mb: 4,
        enable_port92: false,
        ..MemoryConfig::default()
    })
    .unwrap();

    // No device: open bus, and no A20 change.
    assert_eq!(pc.io.read_u8(0x92), 0xFF);
    pc.io.write_u8(0x92, 0x02);
    assert!(!pc.mem.borrow().a20_enabled());
}

#[test]
fn pc98_f2_and_f6_ports_control_the_a20_mask() {
    let mut pc = pc98(4, false);

    // Bit 0 of F2h reads the *masked* state.
    assert_eq!(pc.io.read_u8(0xF2) & 0x01, 0x01);

    // Any write to F2h unmasks.
    pc.io.write_u8(0xF2, 0x00);
    assert!(pc.mem.borrow().a20_enabled());
    assert_eq!(pc.io.read_u8(0xF2) & 0x01, 0x00);

    // F6h: 0000 001x, x = mask.
    pc.io.write_u8(0xF6, 0x03);
    assert!(!pc.mem.borrow().a20_enabled());
    pc.io.write_u8(0xF6, 0x02);
    assert!(pc.mem.borrow().a20_enabled());
}

#[test]
fn pc98_43b_reports_the_15mb_hole() {
    let mut pc = pc98(32, false);
    assert_eq!(pc.io.read_u8(0x43B) & 0x04, 0x04);

    let mut pc = pc98(32, true);
    assert_eq!(pc.io.read_u8(0x43B) & 0x04, 0x00);

    // Less than 15 MiB of RAM also reads as "in use".
    let mut pc = pc98(8, false);
    assert_eq!(pc.io.read_u8(0x43B) & 0x04, 0x00);
}

#[test]
fn pc98_reset_uses_the_shut_latches() {
    let pc = pc98(4, false);

    {
        let mut mem = pc.mem.borrow_mut();
        mem.write16(0x404, 0x0100); // SP
        mem.write16(0x406, 0x2000); // SS
        mem.write16(0x2000 * 16 + 0x0100, 0x0032); // IP
        mem.write16(0x2000 * 16 + 0x0102, 0x0040); // CS
    }

    pc.pc98_shut.set_shut0(false);
    // Even with a CMOS byte set, PC-98 decodes the SHUT latches.
    pc.shutdown.set(0x05);

    assert_eq!(
        pc.reset.on_software_cpu_reset(),
        Some(CpuRedirect::Pc98ResumeAfterReset {
            ss: 0x2000,
            sp: 0x0104,
            cs: 0x0040,
            ip: 0x0032,
        })
    );
}

#[test]
fn rom_writes_on_pc98_fourth_plane_are_silent() {
    let pc = pc98(4, false);
    let mut mem = pc.mem.borrow_mut();

    // Map the fourth-plane aperture as ROM the way the platform init does.
    mem.map_rom_physmem(0xE0000, 0xE7FFF).unwrap();
    mem.phys_write8(0xE0000, 0x31);

    // The write is dropped either way; on PC-98 it is also unlogged, which
    // this test can only observe as "no data change".
    mem.write8(0xE0000, 0x00);
    assert_eq!(mem.read8(0xE0000), 0x31);
}
