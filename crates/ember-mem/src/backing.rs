//! RAM backing store: a heap allocation, or a shared file mapping when a
//! memory file is configured.
//!
//! The file layout is flat: the first `pages * 4096` bytes hold the
//! below-4 GiB RAM, and the region at offset `0x1_0000_0000` holds RAM
//! above 4 GiB. The ~64 MiB BIOS/MMIO gap below 4 GiB is never written, so
//! on filesystems with sparse-file support it occupies no disk space. RAM
//! above 4 GiB is only available with a memory file.

use crate::{PageNum, PAGE_SHIFT, PAGE_SIZE};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackingError {
    #[error("cannot open memory file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("memory file {path} exists and is not a regular file")]
    NotAFile { path: PathBuf },
    #[error("cannot size memory file to {size} bytes: {source}")]
    Truncate { size: u64, source: io::Error },
    #[error("cannot map memory file: {source}")]
    Map { source: io::Error },
    #[error("cannot allocate {0} bytes of guest RAM")]
    Allocation(usize),
}

/// A shared, writable mapping of the guest memory file.
///
/// The file is truncated to zero and re-extended on open, which both zeroes
/// the contents and makes the file sparse where the host supports it.
struct FileMapping {
    base: *mut u8,
    len: usize,
}

impl FileMapping {
    fn create(path: &Path, len: usize) -> Result<FileMapping, BackingError> {
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| BackingError::Open {
            path: path.to_owned(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;

        // SAFETY: plain POSIX calls on a path we own; the fd is closed on
        // every exit path and the mapping outlives the fd.
        unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            if libc::lstat(cpath.as_ptr(), &mut st) == 0 {
                if (st.st_mode & libc::S_IFMT) != libc::S_IFREG {
                    return Err(BackingError::NotAFile {
                        path: path.to_owned(),
                    });
                }
            } else if io::Error::last_os_error().raw_os_error() != Some(libc::ENOENT) {
                return Err(BackingError::Open {
                    path: path.to_owned(),
                    source: io::Error::last_os_error(),
                });
            }

            let fd = libc::open(cpath.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
            if fd < 0 {
                return Err(BackingError::Open {
                    path: path.to_owned(),
                    source: io::Error::last_os_error(),
                });
            }

            // Truncate to zero first so stale contents never leak into
            // guest RAM, then extend; the hole left behind is sparse.
            if libc::ftruncate(fd, 0) != 0 || libc::ftruncate(fd, len as libc::off_t) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(BackingError::Truncate {
                    size: len as u64,
                    source: err,
                });
            }

            let base = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if base == libc::MAP_FAILED {
                return Err(BackingError::Map {
                    source: io::Error::last_os_error(),
                });
            }

            Ok(FileMapping {
                base: base as *mut u8,
                len,
            })
        }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is PROT_READ|PROT_WRITE for `len` bytes and
        // lives until Drop.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region returned by mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

enum Backing {
    Heap(Box<[u8]>),
    File(FileMapping),
}

/// Process-wide byte store for guest RAM.
pub struct RamStore {
    backing: Backing,
    below_pages: u32,
    high_pages: u32,
}

/// Offset of the above-4 GiB region inside the memory file.
const HIGH_REGION_OFFSET: u64 = 0x1_0000_0000;

impl RamStore {
    /// Heap-backed store covering `pages` below-4 GiB pages.
    pub fn heap(pages: u32) -> Result<RamStore, BackingError> {
        let len = (pages as usize) << PAGE_SHIFT;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| BackingError::Allocation(len))?;
        buf.resize(len, 0u8);
        Ok(RamStore {
            backing: Backing::Heap(buf.into_boxed_slice()),
            below_pages: pages,
            high_pages: 0,
        })
    }

    /// File-backed store covering `pages` below-4 GiB pages plus
    /// `high_pages` pages at the 4 GiB file offset.
    pub fn file_backed(
        path: &Path,
        pages: u32,
        high_pages: u32,
    ) -> Result<RamStore, BackingError> {
        let mut len = (pages as u64) << PAGE_SHIFT;
        if high_pages > 0 {
            len = len.max(HIGH_REGION_OFFSET + ((high_pages as u64) << PAGE_SHIFT));
        }
        let mapping = FileMapping::create(path, len as usize)?;
        Ok(RamStore {
            backing: Backing::File(mapping),
            below_pages: pages,
            high_pages,
        })
    }

    pub fn below_pages(&self) -> u32 {
        self.below_pages
    }

    pub fn high_pages(&self) -> u32 {
        self.high_pages
    }

    /// Total below-4 GiB size in bytes (`MemSize` in the classic layout).
    pub fn below_len(&self) -> usize {
        (self.below_pages as usize) << PAGE_SHIFT
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Heap(b) => b,
            Backing::File(m) => m.as_slice(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Heap(b) => b,
            Backing::File(m) => m.as_mut_slice(),
        }
    }

    /// Below-4 GiB RAM as one contiguous slice.
    pub fn below(&self) -> &[u8] {
        &self.bytes()[..self.below_len()]
    }

    pub fn below_mut(&mut self) -> &mut [u8] {
        let len = self.below_len();
        &mut self.bytes_mut()[..len]
    }

    /// One below-4 GiB page, or `None` past the end of the store.
    pub fn page(&self, page: PageNum) -> Option<&[u8]> {
        if page >= self.below_pages {
            return None;
        }
        let ofs = (page as usize) << PAGE_SHIFT;
        Some(&self.bytes()[ofs..ofs + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, page: PageNum) -> Option<&mut [u8]> {
        if page >= self.below_pages {
            return None;
        }
        let ofs = (page as usize) << PAGE_SHIFT;
        Some(&mut self.bytes_mut()[ofs..ofs + PAGE_SIZE])
    }

    /// One page of the above-4 GiB region, indexed from the 4 GiB boundary.
    pub fn high_page(&self, index: u32) -> Option<&[u8]> {
        if index >= self.high_pages {
            return None;
        }
        let ofs = HIGH_REGION_OFFSET as usize + ((index as usize) << PAGE_SHIFT);
        Some(&self.bytes()[ofs..ofs + PAGE_SIZE])
    }

    pub fn high_page_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        if index >= self.high_pages {
            return None;
        }
        let ofs = HIGH_REGION_OFFSET as usize + ((index as usize) << PAGE_SHIFT);
        Some(&mut self.bytes_mut()[ofs..ofs + PAGE_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_store_is_zeroed_and_page_indexed() {
        let mut store = RamStore::heap(4).unwrap();
        assert_eq!(store.below_len(), 4 * PAGE_SIZE);
        assert!(store.below().iter().all(|&b| b == 0));

        store.page_mut(2).unwrap()[7] = 0xAB;
        assert_eq!(store.page(2).unwrap()[7], 0xAB);
        assert!(store.page(4).is_none());
        assert!(store.high_page(0).is_none());
    }

    #[test]
    fn file_store_covers_high_region() {
        let dir = std::env::temp_dir().join(format!("ember-mem-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("guest.mem");

        let mut store = RamStore::file_backed(&path, 8, 2).unwrap();
        store.page_mut(1).unwrap()[0] = 0x11;
        store.high_page_mut(1).unwrap()[0] = 0x22;
        assert_eq!(store.page(1).unwrap()[0], 0x11);
        assert_eq!(store.high_page(1).unwrap()[0], 0x22);
        assert!(store.high_page(2).is_none());

        drop(store);
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), HIGH_REGION_OFFSET + 2 * PAGE_SIZE as u64);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reopening_a_file_store_zeroes_it() {
        let dir = std::env::temp_dir().join(format!("ember-mem-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("guest.mem");

        {
            let mut store = RamStore::file_backed(&path, 2, 0).unwrap();
            store.page_mut(0).unwrap().fill(0xEE);
        }
        let store = RamStore::file_backed(&path, 2, 0).unwrap();
        assert!(store.page(0).unwrap().iter().all(|&b| b == 0));
        std::fs::remove_file(&path).unwrap();
    }
}
