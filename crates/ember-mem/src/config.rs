//! Configuration and subsystem construction.
//!
//! Sizing follows the classic PC memory map rules: the configured RAM is
//! clamped so the top of the aliased address space stays free for BIOS and
//! MMIO, capped by what the host build can address, and anything above
//! `0xF8000000` is moved to the file-backed region above 4 GiB.

use crate::a20::{A20Mode, A20State, A20_PAGE_BIT};
use crate::backing::{BackingError, RamStore};
use crate::callout::CalloutRegistry;
use crate::handler::{AcpiRegion, Builtins, MemCore};
use crate::lfb::LfbRecords;
use crate::table::HandlerTable;
use crate::{MemorySystem, PAGE_SHIFT};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};

/// CPU generation, used to auto-select the physical address width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuKind {
    Cpu8086,
    Cpu286,
    Cpu386,
    Cpu486,
    Pentium,
    PentiumMmx,
    PentiumII,
}

/// Machine architecture profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineProfile {
    PcAt,
    Pc98,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("memory aliasing below 1 MiB is unusable (address_bits={0})")]
    AliasMaskBelow1MiB(u32),
    #[error(transparent)]
    Backing(#[from] BackingError),
}

/// Memory subsystem configuration. Field names follow the emulator's
/// configuration keys.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// RAM size in MiB (`memsize`).
    pub memsize_mb: u32,
    /// Additional RAM in KiB (`memsizekb`), rounded up to a 4 KiB multiple.
    pub memsize_kb: u32,
    /// Emulated address-bus width (`memalias`); 0 selects automatically
    /// from `cpu`, otherwise clamped to `[20, 40]`.
    pub address_bits: u32,
    /// Backing file for guest RAM (`memory file`); required for RAM above
    /// 4 GiB.
    pub memory_file: Option<PathBuf>,
    pub a20: A20Mode,
    /// Install the PS/2 system control port A at 92h (`enable port 92`).
    pub enable_port92: bool,
    /// Honour port 92h bit 0 reset requests.
    pub allow_port92_reset: bool,
    pub isa_memory_hole_15mb: bool,
    pub pcibus_enable: bool,
    pub machine: MachineProfile,
    pub cpu: CpuKind,
    /// A guest-supplied BIOS owns reset behaviour; the CMOS shutdown-byte
    /// dispatch becomes a no-op.
    pub custom_bios: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memsize_mb: 16,
            memsize_kb: 0,
            address_bits: 0,
            memory_file: None,
            a20: A20Mode::Mask,
            enable_port92: true,
            allow_port92_reset: true,
            isa_memory_hole_15mb: false,
            pcibus_enable: true,
            machine: MachineProfile::PcAt,
            cpu: CpuKind::PentiumII,
            custom_bios: false,
        }
    }
}

struct Sizing {
    address_bits: u32,
    alias_pagemask: u32,
    pages: u32,
    reported_pages: u32,
    reported_pages_4gb: u32,
    handler_pages: u32,
}

/// RAM at and above this physical address is redirected to the above-4 GiB
/// region, keeping the top of the 32-bit space free for BIOS and MMIO.
const BELOW_4GB_LIMIT: u64 = 0xF800_0000;

fn derive_sizing(cfg: &MemoryConfig) -> Result<Sizing, ConfigError> {
    let mut address_bits = cfg.address_bits;
    if address_bits == 0 {
        address_bits = if cfg.cpu >= CpuKind::PentiumII {
            36
        } else if cfg.cpu >= CpuKind::Cpu386 {
            32
        } else if cfg.cpu >= CpuKind::Cpu286 {
            24
        } else {
            20
        };
    }
    address_bits = address_bits.clamp(20, 40);

    let alias_pagemask = (((1u64 << address_bits) - 1) >> PAGE_SHIFT) as u32;
    if (alias_pagemask & 0xFF) != 0xFF {
        return Err(ConfigError::AliasMaskBelow1MiB(address_bits));
    }

    let mut memsize_mb = u64::from(cfg.memsize_mb);
    // Round the KiB component up to a whole page.
    let mut memsize_kb = (u64::from(cfg.memsize_kb) + 3) & !3;
    if memsize_kb == 0 && memsize_mb < 1 {
        memsize_mb = 1;
    }
    memsize_kb += memsize_mb * 1024;

    // Keep the top of the aliased space free: 64 MiB on wide buses, 1 MiB
    // on 24-bit ISA machines, 64 KiB on a bare 8086 bus.
    let total_alias_pages = u64::from(alias_pagemask) + 1;
    let reserved_pages: u64 = if address_bits >= 30 {
        0x4000
    } else if address_bits >= 24 {
        0x100
    } else {
        0x10
    };
    let max_alias_kb = (total_alias_pages - reserved_pages) * 4;
    if memsize_kb > max_alias_kb {
        warn!(
            address_bits,
            max_kb = max_alias_kb,
            "memory aliasing limits the configured RAM size"
        );
        memsize_kb = max_alias_kb;
    }

    // Host build limits: 1 GiB on 32-bit hosts, 1 TiB on 64-bit hosts.
    let host_cap_kb: u64 = if cfg!(target_pointer_width = "64") {
        1 << 30
    } else {
        1 << 20
    };
    if memsize_kb > host_cap_kb {
        warn!(max_kb = host_cap_kb, "clamping RAM to the host build limit");
        memsize_kb = host_cap_kb;
    }

    // Split anything above 0xF8000000 into the above-4 GiB region.
    let mut memsize_kb_4gb = 0u64;
    if address_bits > 32 && memsize_kb > (BELOW_4GB_LIMIT >> 10) {
        memsize_kb_4gb = memsize_kb - (BELOW_4GB_LIMIT >> 10);
        memsize_kb = BELOW_4GB_LIMIT >> 10;
    }

    let reported_pages = (memsize_kb / 4) as u32;
    // Far too much code assumes at least 1 MiB of backing store exists,
    // even when less is reported to the guest.
    let pages = reported_pages.max(0x100);
    let handler_pages = total_alias_pages.min(1 << 20) as u32;

    debug!(
        address_bits,
        alias_pagemask,
        pages,
        reported_pages,
        reported_pages_4gb = (memsize_kb_4gb / 4) as u32,
        handler_pages,
        "memory sizing"
    );

    Ok(Sizing {
        address_bits,
        alias_pagemask,
        pages,
        reported_pages,
        reported_pages_4gb: (memsize_kb_4gb / 4) as u32,
        handler_pages,
    })
}

impl MemorySystem {
    pub fn new(cfg: MemoryConfig) -> Result<MemorySystem, ConfigError> {
        let sizing = derive_sizing(&cfg)?;
        let mut reported_pages_4gb = sizing.reported_pages_4gb;

        let store = match &cfg.memory_file {
            Some(path) => {
                if reported_pages_4gb != 0 && !cfg!(target_pointer_width = "64") {
                    warn!("RAM above 4 GiB needs a 64-bit host; dropping it");
                    reported_pages_4gb = 0;
                }
                RamStore::file_backed(path, sizing.pages, reported_pages_4gb)?
            }
            None => {
                if reported_pages_4gb != 0 {
                    warn!("RAM above 4 GiB requires a memory file; dropping it");
                    reported_pages_4gb = 0;
                }
                RamStore::heap(sizing.pages)?
            }
        };

        let a20 = A20State::from_mode(cfg.a20);
        let mut alias_pagemask_active = sizing.alias_pagemask;
        if !a20.enabled {
            alias_pagemask_active &= !A20_PAGE_BIT;
        }

        let mut core = MemCore {
            store,
            acpi: AcpiRegion::empty(),
            a20,
            machine: cfg.machine,
            isa_memory_hole_15mb: cfg.isa_memory_hole_15mb,
            pages: sizing.pages,
            reported_pages: sizing.reported_pages,
            reported_pages_4gb,
            handler_pages: sizing.handler_pages,
            address_bits: sizing.address_bits,
            alias_pagemask: sizing.alias_pagemask,
            alias_pagemask_active,
        };

        // Fill patterns: reported RAM reads zero, the tail of the backing
        // store and the adapter ROM area float high, the system BIOS pages
        // start zeroed.
        let reported_len = (sizing.reported_pages as usize) << PAGE_SHIFT;
        let below = core.store.below_mut();
        below[reported_len..].fill(0xFF);
        below[0xA0000..0x100000].fill(0xFF);
        below[0xF0000..0x100000].fill(0x00);

        let builtins = Builtins::new();
        let mut table = HandlerTable::new(sizing.handler_pages);

        for page in 0..sizing.reported_pages.min(sizing.handler_pages) {
            table.slots[page as usize] = Some(builtins.ram.clone());
        }
        // The adapter space belongs to devices; clear it back to the slow
        // path so VGA and option ROMs claim it on first touch.
        for page in 0xA0..0x100usize {
            table.slots[page] = None;
        }
        if cfg.isa_memory_hole_15mb {
            for page in 0xF00..=0xFFFusize {
                if page < table.slots.len() {
                    table.slots[page] = None;
                }
            }
        }
        // System BIOS window.
        for page in 0xF0..0x100usize {
            table.slots[page] = Some(builtins.rom.clone());
        }

        let mut mhandles = vec![0; sizing.pages as usize];
        if cfg.isa_memory_hole_15mb {
            // Block the hole off with a dummy handle so the allocator never
            // hands those pages out.
            for page in 0xF00..=0xFFF {
                if page < mhandles.len() {
                    mhandles[page] = i32::MAX;
                }
            }
        }

        let hw_next_assign = sizing.pages << PAGE_SHIFT;
        debug!(hw_next_assign, "hardware assignment cursor");

        Ok(MemorySystem {
            core,
            table,
            callouts: CalloutRegistry::new(),
            builtins,
            lfb: Rc::new(RefCell::new(LfbRecords::default())),
            lfb_cb: None,
            lfb_mmio_cb: None,
            passthrough: None,
            mhandles,
            hw_next_assign,
            pcibus_enable: cfg.pcibus_enable,
            vga_handlers: std::array::from_fn(|_| None),
            tlb_sink: None,
            cfg,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.cfg
    }
}
