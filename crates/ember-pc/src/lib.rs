#![forbid(unsafe_code)]

//! PC platform composition: wires the memory subsystem, the I/O port bus
//! and the system-control/reset devices into one value.
//!
//! Which ports exist depends on the machine profile: PC/AT installs the
//! PS/2 system control port A at 92h (when enabled), PC-98 installs the
//! F2h/F6h A20 ports and the 43Bh memory-space register.

use ember_devices::pc98::{
    Pc98A20Ports, Pc98MemSpacePort, PC98_A20_CONTROL_PORT, PC98_A20_STATUS_PORT,
    PC98_MEMSPACE_PORT,
};
use ember_devices::sysctrl::SYSTEM_CONTROL_PORT_A;
use ember_devices::{
    CmosShutdownLatch, Pc98ShutLatches, SoftwareResetDispatcher, SystemControlPortA,
};
use ember_mem::{ConfigError, MachineProfile, MemoryConfig, MemorySystem, SharedMemorySystem};
use ember_platform::io::IoPortBus;
use ember_platform::reset::RedirectLatch;
use std::rc::Rc;

pub struct PcPlatform {
    pub mem: SharedMemorySystem,
    pub io: IoPortBus,
    pub redirect: RedirectLatch,
    pub shutdown: CmosShutdownLatch,
    pub pc98_shut: Pc98ShutLatches,
    pub reset: Rc<SoftwareResetDispatcher>,
}

impl PcPlatform {
    pub fn new(cfg: MemoryConfig) -> Result<PcPlatform, ConfigError> {
        let machine = cfg.machine;
        let enable_port92 = cfg.enable_port92;
        let allow_port92_reset = cfg.allow_port92_reset;

        let mem = MemorySystem::new(cfg)?.into_shared();
        let mut io = IoPortBus::new();
        let redirect = RedirectLatch::new();
        let shutdown = CmosShutdownLatch::new();
        let pc98_shut = Pc98ShutLatches::new();

        let reset = Rc::new(SoftwareResetDispatcher::new(
            mem.clone(),
            shutdown.clone(),
            pc98_shut.clone(),
            redirect.clone(),
        ));

        match machine {
            MachineProfile::PcAt => {
                if enable_port92 {
                    io.register(
                        SYSTEM_CONTROL_PORT_A,
                        Box::new(SystemControlPortA::new(
                            mem.clone(),
                            reset.clone(),
                            allow_port92_reset,
                        )),
                    );
                }
            }
            MachineProfile::Pc98 => {
                let a20 = Pc98A20Ports::new(mem.clone());
                io.register(PC98_A20_STATUS_PORT, Box::new(a20.clone()));
                io.register(PC98_A20_CONTROL_PORT, Box::new(a20));
                io.register(
                    PC98_MEMSPACE_PORT,
                    Box::new(Pc98MemSpacePort::new(mem.clone())),
                );
            }
        }

        Ok(PcPlatform {
            mem,
            io,
            redirect,
            shutdown,
            pc98_shut,
            reset,
        })
    }
}
