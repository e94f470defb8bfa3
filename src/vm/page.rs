//! Per-process page bookkeeping.
//!
//! The supplemental page table names where each logical user page lives
//! right now: in a frame, in a swap slot, or not yet materialized (a
//! memory-mapped page that has never faulted). The variants are a tagged
//! sum on the entry; an entry additionally carries its mmap backing when
//! it has one, and mmap pages never go to swap — eviction writes them
//! back to their file instead.
//!
//! The executable page table is a side table of lazy-load descriptors
//! filled in at program load and immutable afterwards; the fault handler
//! is its only consumer. Code pages are never written back anywhere:
//! their bytes are always recoverable from the image.

use alloc::sync::Arc;

use spin::Mutex;

use crate::file::File;

/// Where a logical page's contents currently live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageLoc {
    /// In memory, in this frame.
    Resident { frame: usize },
    /// In the swap device, starting at this sector.
    Swapped { slot: usize },
    /// Not yet materialized; the backing source fills it at first fault.
    Lazy,
}

/// File backing of a memory-mapped page.
#[derive(Clone)]
pub struct MmapInfo {
    pub file: Arc<File>,
    /// Byte offset of this page within the file.
    pub offset: usize,
    /// Bytes of file data in this page; the rest is zero fill.
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

pub struct PageInfo {
    pub loc: PageLoc,
    pub writable: bool,
    /// Present iff the page is memory-mapped.
    pub mmap: Option<MmapInfo>,
}

/// One supplemental page table entry. Shared between the process's table
/// and the frame table entry holding the page while resident.
pub struct SptEntry {
    /// The user page this entry describes.
    page: usize,
    pub(crate) state: Mutex<PageInfo>,
}

impl SptEntry {
    /// A page that already sits in `frame`.
    pub fn new_resident(page: usize, frame: usize, writable: bool) -> Self {
        Self {
            page,
            state: Mutex::new(PageInfo {
                loc: PageLoc::Resident { frame },
                writable,
                mmap: None,
            }),
        }
    }

    /// A memory-mapped page, materialized lazily. Mapped pages are
    /// semantically always writable.
    pub fn new_mmap(page: usize, mmap: MmapInfo) -> Self {
        Self {
            page,
            state: Mutex::new(PageInfo {
                loc: PageLoc::Lazy,
                writable: true,
                mmap: Some(mmap),
            }),
        }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn loc(&self) -> PageLoc {
        self.state.lock().loc
    }

    pub fn is_mmap(&self) -> bool {
        self.state.lock().mmap.is_some()
    }
}

/// Lazy-load descriptor for one executable page. Immutable once inserted.
#[derive(Clone, Copy)]
pub struct ExecPage {
    /// Byte offset of the page's data in the executable image.
    pub offset: usize,
    /// Bytes to read from the image; the rest of the page is zeros (bss).
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}
