//! EMS/XMS page handle allocator.
//!
//! Extended memory pages from [`XMS_START`] up to the reported RAM size are
//! handed out in chains. `mhandles[p]` holds `0` for a free page, `-1` for
//! the last page of a chain, or the next page number in the chain. A handle
//! is the first page of its chain; handle `0` means "no allocation".

use crate::{MemHandle, MemorySystem, PageNum, XMS_START};
use tracing::warn;

impl MemorySystem {
    fn alloc_end(&self) -> PageNum {
        self.core.reported_pages.min(self.mhandles.len() as u32)
    }

    /// Free pages available to the allocator.
    pub fn free_total(&self) -> u32 {
        let end = self.alloc_end();
        (XMS_START..end)
            .filter(|&p| self.mhandles[p as usize] == 0)
            .count() as u32
    }

    /// Length of the largest free run.
    pub fn free_largest(&self) -> u32 {
        let end = self.alloc_end();
        let mut largest = 0u32;
        let mut run = 0u32;
        for page in XMS_START..end {
            if self.mhandles[page as usize] == 0 {
                run += 1;
            } else {
                largest = largest.max(run);
                run = 0;
            }
        }
        largest.max(run)
    }

    /// Chain length of `handle`.
    pub fn allocated_pages(&self, mut handle: MemHandle) -> u32 {
        let mut pages = 0;
        while handle > 0 {
            pages += 1;
            handle = self.mhandles[handle as usize];
        }
        pages
    }

    /// Best-fit scan: the start of the smallest free run of at least `size`
    /// pages, or 0 when none exists. An exact-size run wins immediately; a
    /// trailing free run at the end of the range also counts.
    fn best_match(&self, size: u32) -> PageNum {
        let end = self.alloc_end();
        let mut first = 0u32;
        let mut best = 0x0FFF_FFFFu32;
        let mut best_first = 0u32;

        let mut index = XMS_START;
        while index < end {
            if first == 0 {
                if self.mhandles[index as usize] == 0 {
                    first = index;
                }
            } else if self.mhandles[index as usize] != 0 {
                let run = index - first;
                if run == size {
                    return first;
                }
                if run > size && run < best {
                    best = run;
                    best_first = first;
                }
                first = 0;
            }
            index += 1;
        }
        if first != 0 && index - first >= size && index - first < best {
            return first;
        }
        best_first
    }

    /// Best-fit over pages whose physical address keeps bit 20 clear, so
    /// the chain stays reachable regardless of the A20 gate. Scans skip
    /// odd megabytes entirely; requests above 1 MiB can never fit.
    fn best_match_a20_friendly(&self, size: u32) -> PageNum {
        if size > 0x100 {
            return 0;
        }

        let end = self.alloc_end();
        let mut first = 0u32;
        let mut best = 0x0FFF_FFFFu32;
        let mut best_first = 0u32;

        let mut index = XMS_START;
        while index < end {
            if first == 0 {
                if index & 0x100 != 0 {
                    // Odd megabyte: round up to the next even one.
                    index = (index | 0xFF) + 1;
                    continue;
                }
                if self.mhandles[index as usize] == 0 {
                    first = index;
                }
            } else if self.mhandles[index as usize] != 0 || index & 0x100 != 0 {
                let run = index - first;
                if run == size {
                    return first;
                }
                if run > size && run < best {
                    best = run;
                    best_first = first;
                }
                first = 0;
            }
            index += 1;
        }
        if first != 0 && index - first >= size && index - first < best {
            return first;
        }
        best_first
    }

    /// Chains `count` pages starting at `index` onto the end of a chain and
    /// returns the handle of the first page.
    fn chain_run(&mut self, mut index: PageNum, count: u32) -> MemHandle {
        let handle = index as MemHandle;
        for _ in 0..count - 1 {
            self.mhandles[index as usize] = index as MemHandle + 1;
            index += 1;
        }
        self.mhandles[index as usize] = -1;
        handle
    }

    fn allocate_with<F>(&mut self, pages: u32, sequence: bool, best: F) -> MemHandle
    where
        F: Fn(&MemorySystem, u32) -> PageNum,
    {
        if pages == 0 {
            return 0;
        }
        if sequence {
            let index = best(self, pages);
            if index == 0 {
                return 0;
            }
            return self.chain_run(index, pages);
        }

        if self.free_total() < pages {
            return 0;
        }
        let mut remaining = pages;
        let mut handle: MemHandle = 0;
        let mut tail: Option<PageNum> = None;
        while remaining > 0 {
            let mut index = best(self, 1);
            if index == 0 {
                // free_total said the pages exist; a failing single-page
                // scan means the handle array is corrupt.
                debug_assert!(false, "allocator free map inconsistent");
                return 0;
            }
            while remaining > 0 && self.mhandles[index as usize] == 0 {
                match tail {
                    Some(prev) => self.mhandles[prev as usize] = index as MemHandle,
                    None => handle = index as MemHandle,
                }
                self.mhandles[index as usize] = -1;
                tail = Some(index);
                index += 1;
                remaining -= 1;
                if index >= self.alloc_end() {
                    break;
                }
            }
        }
        handle
    }

    /// Allocates `pages` pages. With `sequence` the chain is one contiguous
    /// best-fit run; otherwise scattered single-page runs are chained
    /// together. Returns 0 when the request cannot be satisfied.
    pub fn allocate_pages(&mut self, pages: u32, sequence: bool) -> MemHandle {
        self.allocate_with(pages, sequence, |m, n| m.best_match(n))
    }

    /// [`MemorySystem::allocate_pages`], restricted to pages that stay
    /// accessible with the A20 gate masked.
    pub fn allocate_pages_a20_friendly(&mut self, pages: u32, sequence: bool) -> MemHandle {
        let handle = self.allocate_with(pages, sequence, |m, n| m.best_match_a20_friendly(n));
        debug_assert!(self.chain_is_a20_friendly(handle));
        handle
    }

    #[cfg(debug_assertions)]
    fn chain_is_a20_friendly(&self, mut handle: MemHandle) -> bool {
        while handle > 0 {
            if handle & 0x100 != 0 {
                return false;
            }
            handle = self.mhandles[handle as usize];
        }
        true
    }

    #[cfg(not(debug_assertions))]
    #[allow(dead_code)]
    fn chain_is_a20_friendly(&self, _handle: MemHandle) -> bool {
        true
    }

    /// First page a single-page allocation would take, without taking it.
    pub fn next_free_page(&self) -> MemHandle {
        self.best_match(1) as MemHandle
    }

    /// Releases a chain, returning every page to the free map.
    pub fn release_pages(&mut self, mut handle: MemHandle) {
        if self.mhandles.is_empty() {
            warn!("release_pages called before the handle array exists");
            return;
        }
        while handle > 0 {
            let next = self.mhandles[handle as usize];
            self.mhandles[handle as usize] = 0;
            handle = next;
        }
    }

    /// Resizes a chain in place where possible.
    ///
    /// Shrinking truncates and frees the tail. Growing first tries to
    /// consume free pages immediately following the chain; failing that, a
    /// sequential chain is moved (allocate + copy + release) and a
    /// scattered chain gets a new segment appended. Returns false and
    /// leaves the chain untouched when the growth cannot be satisfied.
    pub fn reallocate_pages(
        &mut self,
        handle: &mut MemHandle,
        pages: u32,
        sequence: bool,
    ) -> bool {
        if *handle <= 0 {
            if pages == 0 {
                return true;
            }
            *handle = self.allocate_pages(pages, sequence);
            return *handle > 0;
        }
        if pages == 0 {
            self.release_pages(*handle);
            *handle = -1;
            return true;
        }

        let mut old_pages = 0u32;
        let mut last = *handle;
        let mut index = *handle;
        while index > 0 {
            old_pages += 1;
            last = index;
            index = self.mhandles[index as usize];
        }

        if old_pages == pages {
            return true;
        }

        if old_pages > pages {
            // Truncate: walk to the new terminal page, then zero the rest.
            let mut walk = pages - 1;
            let mut index = *handle;
            let mut remaining = old_pages - 1;
            while walk > 0 {
                index = self.mhandles[index as usize];
                walk -= 1;
                remaining -= 1;
            }
            let mut next = self.mhandles[index as usize];
            self.mhandles[index as usize] = -1;
            while remaining > 0 {
                let after = self.mhandles[next as usize];
                self.mhandles[next as usize] = 0;
                next = after;
                remaining -= 1;
            }
            return true;
        }

        let need = pages - old_pages;
        if sequence {
            // Extend with the free pages right behind the chain, if enough.
            let end = self.alloc_end();
            let mut index = last as u32 + 1;
            let mut free = 0u32;
            while index < end && self.mhandles[index as usize] == 0 {
                index += 1;
                free += 1;
            }
            if free >= need {
                let mut index = last as u32;
                for _ in 0..need {
                    self.mhandles[index as usize] = index as MemHandle + 1;
                    index += 1;
                }
                self.mhandles[index as usize] = -1;
                return true;
            }

            // Not enough room in place: move the whole allocation.
            let new_handle = self.allocate_pages(pages, true);
            if new_handle == 0 {
                return false;
            }
            self.block_copy(
                (new_handle as u32) << crate::PAGE_SHIFT,
                (*handle as u32) << crate::PAGE_SHIFT,
                (old_pages as usize) << crate::PAGE_SHIFT,
            );
            self.release_pages(*handle);
            *handle = new_handle;
            return true;
        }

        // Scattered chains just grow a new segment.
        let extension = self.allocate_pages(need, false);
        if extension == 0 {
            return false;
        }
        self.mhandles[last as usize] = extension;
        true
    }

    /// Next page in a chain (`-1` past the end).
    pub fn next_handle(&self, handle: MemHandle) -> MemHandle {
        self.mhandles[handle as usize]
    }

    /// Page `offset` links into a chain.
    pub fn next_handle_at(&self, mut handle: MemHandle, mut offset: u32) -> MemHandle {
        while offset > 0 {
            offset -= 1;
            handle = self.mhandles[handle as usize];
        }
        handle
    }
}
