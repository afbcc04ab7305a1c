//! Linear framebuffer mapping.
//!
//! The video card asks for its LFB (and optionally an MMIO block) to be
//! routed through the callout system rather than installed eagerly: the
//! claim is registered in the PCI bucket (ISA when the PCI bus is absent)
//! and resolved on first access. The MMIO block sits 16 MiB above the LFB
//! base and is 16 pages long, matching the S3 BAR layout.

use crate::callout::{memmask_combine, memmask_range, CalloutFn, CalloutType, MEMMASK_FULL};
use crate::handler::PageHandler;
use crate::{MemorySystem, PageNum};
use std::rc::Rc;
use tracing::{debug, error};

/// MMIO offset from the LFB base page (16 MiB).
const LFB_MMIO_OFFSET_PAGES: u32 = 0x0100_0000 >> 12;
const LFB_MMIO_PAGES: u32 = 16;

#[derive(Default)]
pub(crate) struct LfbRange {
    pub(crate) start_page: PageNum,
    pub(crate) end_page: PageNum,
    pub(crate) pages: u32,
    pub(crate) handler: Option<Rc<dyn PageHandler>>,
}

impl LfbRange {
    fn clear(&mut self) {
        self.start_page = 0;
        self.end_page = 0;
        self.pages = 0;
    }
}

#[derive(Default)]
pub(crate) struct LfbRecords {
    pub(crate) lfb: LfbRange,
    pub(crate) mmio: LfbRange,
}

fn opt_handler_eq(a: &Option<Rc<dyn PageHandler>>, b: &Option<Rc<dyn PageHandler>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

impl MemorySystem {
    fn lfb_bucket(&self) -> CalloutType {
        if self.pcibus_enable {
            CalloutType::Pci
        } else {
            CalloutType::Isa
        }
    }

    fn lfb_claim_fn(&self) -> CalloutFn {
        let records = self.lfb.clone();
        Box::new(move |_co, page| {
            let r = records.borrow();
            if r.lfb.start_page == 0 || r.lfb.pages == 0 {
                return None;
            }
            if page >= r.lfb.start_page && page < r.lfb.end_page {
                return r.lfb.handler.clone();
            }
            if page >= r.mmio.start_page && page < r.mmio.end_page {
                return r.mmio.handler.clone();
            }
            None
        })
    }

    fn lfb_free_callouts(&mut self) {
        if let Some(cb) = self.lfb_cb.take() {
            self.callout_free(cb);
        }
        if let Some(cb) = self.lfb_mmio_cb.take() {
            self.callout_free(cb);
        }
    }

    /// (Re)installs one LFB callout over `range`, covered by the smallest
    /// power-of-two page count.
    fn lfb_install_callout(&mut self, cb: crate::CalloutHandle, start_page: PageNum, pages: u32) {
        self.callout_get(cb);
        self.callout_uninstall(cb);
        if pages != 0 {
            let p2 = pages.next_power_of_two();
            let mask = memmask_combine(MEMMASK_FULL, memmask_range(p2));
            let claim = self.lfb_claim_fn();
            self.callout_install(cb, start_page, mask, claim);
        }
        self.callout_put(cb);
    }

    /// Moves, installs or removes the linear framebuffer mapping.
    ///
    /// `pages == 0` (or `page == 0`) removes it. When `mmio_handler` is
    /// given, the MMIO block is placed at the fixed S3 offset. Any change
    /// flushes the TLB.
    pub fn set_lfb(
        &mut self,
        page: PageNum,
        pages: u32,
        handler: Option<Rc<dyn PageHandler>>,
        mmio_handler: Option<Rc<dyn PageHandler>>,
    ) {
        {
            let r = self.lfb.borrow();
            if page == r.lfb.start_page
                && r.lfb.end_page == page + pages
                && r.lfb.pages == pages
                && opt_handler_eq(&r.lfb.handler, &handler)
                && opt_handler_eq(&r.mmio.handler, &mmio_handler)
            {
                return;
            }
        }

        {
            let mut r = self.lfb.borrow_mut();
            r.lfb.handler = handler.clone();
            if handler.is_some() {
                r.lfb.start_page = page;
                r.lfb.end_page = page + pages;
                r.lfb.pages = pages;
            } else {
                r.lfb.clear();
            }

            r.mmio.handler = mmio_handler.clone();
            if mmio_handler.is_some() {
                r.mmio.start_page = page + LFB_MMIO_OFFSET_PAGES;
                r.mmio.end_page = page + LFB_MMIO_OFFSET_PAGES + LFB_MMIO_PAGES;
                r.mmio.pages = LFB_MMIO_PAGES;
            } else {
                r.mmio.clear();
            }
        }

        if pages == 0 || page == 0 {
            self.lfb_free_callouts();
            debug!("linear framebuffer disabled");
        } else {
            let bucket = self.lfb_bucket();
            if self.lfb_cb.is_none() {
                self.lfb_cb = self.callout_allocate(bucket);
            }
            if self.lfb_mmio_cb.is_none() {
                self.lfb_mmio_cb = self.callout_allocate(bucket);
            }
            let (Some(lfb_cb), Some(mmio_cb)) = (self.lfb_cb, self.lfb_mmio_cb) else {
                error!("unable to allocate callouts for the linear framebuffer");
                return;
            };

            self.lfb_install_callout(lfb_cb, page, pages);
            let (mmio_start, mmio_pages) = {
                let r = self.lfb.borrow();
                (r.mmio.start_page, r.mmio.pages)
            };
            self.lfb_install_callout(mmio_cb, mmio_start, mmio_pages);

            debug!(
                base = (page as u64) << 12,
                kb = pages * 4,
                "linear framebuffer mapped"
            );
        }

        self.flush_tlb();
    }
}
