//! Guest memory access: sized reads/writes, block moves and string
//! helpers over linear addresses, and the physical device-access path.
//!
//! Linear addresses here are what the CPU core hands down after
//! segmentation; paging is the CPU's concern, so linear and physical
//! coincide at this layer. Block moves take a fast path whenever the range
//! stays inside one 4 KiB page and the resolved handler discloses a host
//! slice (the same pointer the paging TLB would have cached).

use crate::handler::PageFlags;
use crate::{LinearAddr, MemorySystem, PageNum, PhysAddr, PAGE_SHIFT};

impl MemorySystem {
    pub fn read8(&mut self, addr: LinearAddr) -> u8 {
        let handler = self.get_handler(addr >> PAGE_SHIFT);
        handler.read8(&mut self.core, PhysAddr::from(addr))
    }

    pub fn write8(&mut self, addr: LinearAddr, val: u8) {
        let handler = self.get_handler(addr >> PAGE_SHIFT);
        handler.write8(&mut self.core, PhysAddr::from(addr), val);
    }

    pub fn read16(&mut self, addr: LinearAddr) -> u16 {
        if addr & 0xFFF <= 0xFFE {
            let handler = self.get_handler(addr >> PAGE_SHIFT);
            handler.read16(&mut self.core, PhysAddr::from(addr))
        } else {
            self.read_unaligned_u16(addr)
        }
    }

    pub fn write16(&mut self, addr: LinearAddr, val: u16) {
        if addr & 0xFFF <= 0xFFE {
            let handler = self.get_handler(addr >> PAGE_SHIFT);
            handler.write16(&mut self.core, PhysAddr::from(addr), val);
        } else {
            self.write_unaligned_u16(addr, val);
        }
    }

    pub fn read32(&mut self, addr: LinearAddr) -> u32 {
        if addr & 0xFFF <= 0xFFC {
            let handler = self.get_handler(addr >> PAGE_SHIFT);
            handler.read32(&mut self.core, PhysAddr::from(addr))
        } else {
            self.read_unaligned_u32(addr)
        }
    }

    pub fn write32(&mut self, addr: LinearAddr, val: u32) {
        if addr & 0xFFF <= 0xFFC {
            let handler = self.get_handler(addr >> PAGE_SHIFT);
            handler.write32(&mut self.core, PhysAddr::from(addr), val);
        } else {
            self.write_unaligned_u32(addr, val);
        }
    }

    /// Page-straddling 16-bit read, split into byte accesses.
    pub fn read_unaligned_u16(&mut self, addr: LinearAddr) -> u16 {
        u16::from(self.read8(addr)) | u16::from(self.read8(addr.wrapping_add(1))) << 8
    }

    pub fn write_unaligned_u16(&mut self, addr: LinearAddr, val: u16) {
        self.write8(addr, val as u8);
        self.write8(addr.wrapping_add(1), (val >> 8) as u8);
    }

    pub fn read_unaligned_u32(&mut self, addr: LinearAddr) -> u32 {
        u32::from(self.read8(addr))
            | u32::from(self.read8(addr.wrapping_add(1))) << 8
            | u32::from(self.read8(addr.wrapping_add(2))) << 16
            | u32::from(self.read8(addr.wrapping_add(3))) << 24
    }

    pub fn write_unaligned_u32(&mut self, addr: LinearAddr, val: u32) {
        self.write8(addr, val as u8);
        self.write8(addr.wrapping_add(1), (val >> 8) as u8);
        self.write8(addr.wrapping_add(2), (val >> 16) as u8);
        self.write8(addr.wrapping_add(3), (val >> 24) as u8);
    }

    /// Copies guest memory into `data`.
    pub fn block_read(&mut self, addr: LinearAddr, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        let last = u64::from(addr) + data.len() as u64 - 1;
        if u64::from(addr >> PAGE_SHIFT) == (last >> PAGE_SHIFT) {
            let page = addr >> PAGE_SHIFT;
            let handler = self.get_handler(page);
            if handler.flags().contains(PageFlags::READABLE) {
                if let Some(slice) = handler.host_read_page(&self.core, page) {
                    let ofs = (addr & 0xFFF) as usize;
                    data.copy_from_slice(&slice[ofs..ofs + data.len()]);
                    return;
                }
            }
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = handler.read8(&mut self.core, PhysAddr::from(addr) + i as u64);
            }
        } else {
            // Split at the page boundary and handle each side on its own.
            let current = (((u64::from(addr) >> PAGE_SHIFT) + 1) << PAGE_SHIFT) - u64::from(addr);
            let (head, tail) = data.split_at_mut(current as usize);
            self.block_read(addr, head);
            self.block_read(addr.wrapping_add(current as u32), tail);
        }
    }

    /// Copies `data` into guest memory.
    pub fn block_write(&mut self, addr: LinearAddr, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let last = u64::from(addr) + data.len() as u64 - 1;
        if u64::from(addr >> PAGE_SHIFT) == (last >> PAGE_SHIFT) {
            let page = addr >> PAGE_SHIFT;
            let handler = self.get_handler(page);
            if handler.flags().contains(PageFlags::WRITEABLE) {
                if let Some(slice) = handler.host_write_page(&mut self.core, page) {
                    let ofs = (addr & 0xFFF) as usize;
                    slice[ofs..ofs + data.len()].copy_from_slice(data);
                    return;
                }
            }
            for (i, &byte) in data.iter().enumerate() {
                handler.write8(&mut self.core, PhysAddr::from(addr) + i as u64, byte);
            }
        } else {
            let current = (((u64::from(addr) >> PAGE_SHIFT) + 1) << PAGE_SHIFT) - u64::from(addr);
            let (head, tail) = data.split_at(current as usize);
            self.block_write(addr, head);
            self.block_write(addr.wrapping_add(current as u32), tail);
        }
    }

    /// Guest-to-guest copy.
    pub fn block_copy(&mut self, dest: LinearAddr, src: LinearAddr, size: usize) {
        self.memcpy_guest(dest, src, size);
    }

    pub fn memcpy_guest(&mut self, mut dest: LinearAddr, mut src: LinearAddr, mut size: usize) {
        let mut buf = [0u8; 4096];
        while size > 0 {
            let chunk = size.min(buf.len());
            self.block_read(src, &mut buf[..chunk]);
            self.block_write(dest, &buf[..chunk]);
            src += chunk as u32;
            dest += chunk as u32;
            size -= chunk;
        }
    }

    /// Length of the NUL-terminated string at `addr`, bounded at 1024.
    pub fn strlen(&mut self, addr: LinearAddr) -> usize {
        for i in 0..1024u32 {
            if self.read8(addr.wrapping_add(i)) == 0 {
                return i as usize;
            }
        }
        0
    }

    /// Copies a NUL-terminated string between guest addresses, including
    /// the terminator.
    pub fn strcpy_guest(&mut self, mut dest: LinearAddr, mut src: LinearAddr) {
        loop {
            let byte = self.read8(src);
            src += 1;
            if byte == 0 {
                break;
            }
            self.write8(dest, byte);
            dest += 1;
        }
        self.write8(dest, 0);
    }

    /// Reads bytes until NUL or `max`, whichever comes first.
    pub fn str_copy(&mut self, addr: LinearAddr, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min(256));
        for i in 0..max {
            let byte = self.read8(addr + i as u32);
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        out
    }

    /// Device access to a full physical address (up to 40 bits). Unlike
    /// [`MemorySystem::read8`] this reaches the above-4 GiB window; like
    /// it, a handler without a host pointer services the access through its
    /// callbacks.
    pub fn physdev_read8(&mut self, addr: PhysAddr) -> u8 {
        let page = (addr >> PAGE_SHIFT) as PageNum;
        let handler = self.get_handler(page);
        if handler.flags().contains(PageFlags::READABLE) {
            if let Some(slice) = handler.host_read_page(&self.core, page) {
                return slice[(addr & 0xFFF) as usize];
            }
        }
        handler.read8(&mut self.core, addr)
    }

    pub fn physdev_read16(&mut self, addr: PhysAddr) -> u16 {
        if addr & 0xFFF <= 0xFFE {
            let page = (addr >> PAGE_SHIFT) as PageNum;
            let handler = self.get_handler(page);
            if handler.flags().contains(PageFlags::READABLE) {
                if let Some(slice) = handler.host_read_page(&self.core, page) {
                    let ofs = (addr & 0xFFF) as usize;
                    return u16::from_le_bytes([slice[ofs], slice[ofs + 1]]);
                }
            }
            handler.read16(&mut self.core, addr)
        } else {
            u16::from(self.physdev_read8(addr)) | u16::from(self.physdev_read8(addr + 1)) << 8
        }
    }

    pub fn physdev_read32(&mut self, addr: PhysAddr) -> u32 {
        if addr & 0xFFF <= 0xFFC {
            let page = (addr >> PAGE_SHIFT) as PageNum;
            let handler = self.get_handler(page);
            if handler.flags().contains(PageFlags::READABLE) {
                if let Some(slice) = handler.host_read_page(&self.core, page) {
                    let ofs = (addr & 0xFFF) as usize;
                    return u32::from_le_bytes([
                        slice[ofs],
                        slice[ofs + 1],
                        slice[ofs + 2],
                        slice[ofs + 3],
                    ]);
                }
            }
            handler.read32(&mut self.core, addr)
        } else {
            u32::from(self.physdev_read16(addr)) | u32::from(self.physdev_read16(addr + 2)) << 16
        }
    }

    pub fn physdev_write8(&mut self, addr: PhysAddr, val: u8) {
        let page = (addr >> PAGE_SHIFT) as PageNum;
        let handler = self.get_handler(page);
        if handler.flags().contains(PageFlags::WRITEABLE) {
            if let Some(slice) = handler.host_write_page(&mut self.core, page) {
                slice[(addr & 0xFFF) as usize] = val;
                return;
            }
        }
        handler.write8(&mut self.core, addr, val);
    }

    pub fn physdev_write16(&mut self, addr: PhysAddr, val: u16) {
        if addr & 0xFFF <= 0xFFE {
            let page = (addr >> PAGE_SHIFT) as PageNum;
            let handler = self.get_handler(page);
            if handler.flags().contains(PageFlags::WRITEABLE) {
                if let Some(slice) = handler.host_write_page(&mut self.core, page) {
                    let ofs = (addr & 0xFFF) as usize;
                    slice[ofs..ofs + 2].copy_from_slice(&val.to_le_bytes());
                    return;
                }
            }
            handler.write16(&mut self.core, addr, val);
        } else {
            self.physdev_write8(addr, val as u8);
            self.physdev_write8(addr + 1, (val >> 8) as u8);
        }
    }

    pub fn physdev_write32(&mut self, addr: PhysAddr, val: u32) {
        if addr & 0xFFF <= 0xFFC {
            let page = (addr >> PAGE_SHIFT) as PageNum;
            let handler = self.get_handler(page);
            if handler.flags().contains(PageFlags::WRITEABLE) {
                if let Some(slice) = handler.host_write_page(&mut self.core, page) {
                    let ofs = (addr & 0xFFF) as usize;
                    slice[ofs..ofs + 4].copy_from_slice(&val.to_le_bytes());
                    return;
                }
            }
            handler.write32(&mut self.core, addr, val);
        } else {
            self.physdev_write16(addr, val as u16);
            self.physdev_write16(addr + 2, (val >> 16) as u16);
        }
    }

    /// Direct system-RAM reads, unaffected by device mappings. Out-of-range
    /// reads float high.
    pub fn phys_read8(&self, addr: u32) -> u8 {
        self.core
            .store()
            .below()
            .get(addr as usize)
            .copied()
            .unwrap_or(0xFF)
    }

    pub fn phys_read16(&self, addr: u32) -> u16 {
        u16::from(self.phys_read8(addr)) | u16::from(self.phys_read8(addr.wrapping_add(1))) << 8
    }

    pub fn phys_read32(&self, addr: u32) -> u32 {
        u32::from(self.phys_read16(addr))
            | u32::from(self.phys_read16(addr.wrapping_add(2))) << 16
    }

    /// Direct system-RAM writes; out-of-range bytes are dropped.
    pub fn phys_write8(&mut self, addr: u32, val: u8) {
        if let Some(byte) = self.core.store_mut().below_mut().get_mut(addr as usize) {
            *byte = val;
        }
    }

    pub fn phys_write16(&mut self, addr: u32, val: u16) {
        self.phys_write8(addr, val as u8);
        self.phys_write8(addr.wrapping_add(1), (val >> 8) as u8);
    }

    pub fn phys_write32(&mut self, addr: u32, val: u32) {
        self.phys_write16(addr, val as u16);
        self.phys_write16(addr.wrapping_add(2), (val >> 16) as u16);
    }

    /// Copies `data` directly into system RAM, clipped to the store.
    pub fn phys_write_slice(&mut self, addr: u32, data: &[u8]) {
        let below = self.core.store_mut().below_mut();
        let start = addr as usize;
        if start >= below.len() {
            return;
        }
        let len = data.len().min(below.len() - start);
        below[start..start + len].copy_from_slice(&data[..len]);
    }
}
