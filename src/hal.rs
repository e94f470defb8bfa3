//! Interfaces to the hardware the surrounding kernel owns.
//!
//! The storage and paging core never talks to devices directly: the block
//! driver, the physical page allocator, and the per-process hardware page
//! tables are all supplied by the embedding kernel through the traits
//! below. Device I/O is treated as infallible here; a driver that can fail
//! must retry or panic below this boundary.

use crate::param::BLOCK_SECTOR_SIZE;

use bitflags::bitflags;

/// A fixed-geometry block device addressed in 512-byte sectors.
pub trait BlockDevice: Send + Sync {
    /// Reads sector `sector` into `buf`.
    fn sector_read(&self, sector: u32, buf: &mut [u8; BLOCK_SECTOR_SIZE]);

    /// Writes `buf` to sector `sector`.
    fn sector_write(&self, sector: u32, buf: &[u8; BLOCK_SECTOR_SIZE]);

    /// Returns the device size in sectors.
    fn sector_count(&self) -> u32;
}

bitflags! {
    /// Page allocation flags.
    pub struct AllocFlags: u32 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Return a zero-filled page.
        const ZERO = 1 << 1;
    }
}

/// The physical page allocator.
///
/// # Safety
///
/// An implementation must hand out `PGSIZE`-aligned addresses of memory
/// regions that are valid for reads and writes of `PGSIZE` bytes and that
/// stay valid and unaliased until passed back to [`FrameAllocator::free`].
pub unsafe trait FrameAllocator: Send + Sync {
    /// Allocates one page, or `None` when the pool is exhausted.
    fn alloc(&self, flags: AllocFlags) -> Option<usize>;

    /// Returns `frame`, previously obtained from [`FrameAllocator::alloc`],
    /// to the pool.
    fn free(&self, frame: usize);
}

/// One process's hardware page table.
///
/// `upage` arguments are page-aligned user virtual addresses; `frame`
/// arguments come from the [`FrameAllocator`]. The accessed and dirty
/// queries reflect the hardware bits the MMU maintains; both return
/// `false` for unmapped pages.
pub trait UserPageTable: Send + Sync {
    /// Maps `upage` to `frame`. Returns false if a page-table page could
    /// not be allocated.
    fn map(&self, upage: usize, frame: usize, writable: bool) -> bool;

    /// Removes the mapping for `upage`, if any.
    fn unmap(&self, upage: usize);

    /// Returns the frame `upage` maps to, if present.
    fn translate(&self, upage: usize) -> Option<usize>;

    fn is_accessed(&self, upage: usize) -> bool;

    fn set_accessed(&self, upage: usize, accessed: bool);

    fn is_dirty(&self, upage: usize) -> bool;
}
