//! Shared test fixtures: an in-memory block device, a capacity-limited
//! frame allocator, and a software page table that emulates the hardware
//! accessed/dirty bits.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use spin::Mutex;

use crate::hal::{AllocFlags, BlockDevice, FrameAllocator, UserPageTable};
use crate::param::{BLOCK_SECTOR_SIZE, PGSIZE};

/// A RAM-backed sector device that counts reads per sector, so tests can
/// observe cache behavior (read-ahead, write-back) from the outside.
pub(crate) struct MemDisk {
    sectors: Mutex<Vec<[u8; BLOCK_SECTOR_SIZE]>>,
    reads: Mutex<Vec<u64>>,
}

impl MemDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; BLOCK_SECTOR_SIZE]; sectors as usize]),
            reads: Mutex::new(vec![0; sectors as usize]),
        }
    }

    /// Raw sector contents, bypassing any cache.
    pub fn peek(&self, sector: u32) -> [u8; BLOCK_SECTOR_SIZE] {
        self.sectors.lock()[sector as usize]
    }

    /// Writes raw sector contents, bypassing any cache.
    pub fn poke(&self, sector: u32, data: &[u8; BLOCK_SECTOR_SIZE]) {
        self.sectors.lock()[sector as usize] = *data;
    }

    /// How many times `sector` has been read from the device.
    pub fn reads_of(&self, sector: u32) -> u64 {
        self.reads.lock()[sector as usize]
    }
}

impl BlockDevice for MemDisk {
    fn sector_read(&self, sector: u32, buf: &mut [u8; BLOCK_SECTOR_SIZE]) {
        *buf = self.sectors.lock()[sector as usize];
        self.reads.lock()[sector as usize] += 1;
    }

    fn sector_write(&self, sector: u32, buf: &[u8; BLOCK_SECTOR_SIZE]) {
        self.sectors.lock()[sector as usize] = *buf;
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().len() as u32
    }
}

/// Hands out real heap pages, at most `capacity` at a time; exhaustion is
/// how tests force eviction. Non-`ZERO` pages are filled with junk so
/// missing zero-fill shows up.
pub(crate) struct TestPalloc {
    capacity: usize,
    outstanding: Mutex<HashSet<usize>>,
}

impl TestPalloc {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            outstanding: Mutex::new(HashSet::new()),
        })
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}

unsafe impl FrameAllocator for TestPalloc {
    fn alloc(&self, flags: AllocFlags) -> Option<usize> {
        let mut outstanding = self.outstanding.lock();
        if outstanding.len() >= self.capacity {
            return None;
        }
        let layout = Layout::from_size_align(PGSIZE, PGSIZE).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null());
        let fill = if flags.contains(AllocFlags::ZERO) { 0 } else { 0xa5 };
        unsafe { core::ptr::write_bytes(ptr, fill, PGSIZE) };
        outstanding.insert(ptr as usize);
        Some(ptr as usize)
    }

    fn free(&self, frame: usize) {
        assert!(
            self.outstanding.lock().remove(&frame),
            "freeing a frame not allocated"
        );
        let layout = Layout::from_size_align(PGSIZE, PGSIZE).unwrap();
        unsafe { dealloc(frame as *mut u8, layout) };
    }
}

#[derive(Clone, Copy)]
struct PageMapping {
    frame: usize,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A software stand-in for one process's hardware page table. Tests set
/// the accessed/dirty bits the way the MMU would on loads and stores.
pub(crate) struct FakePageDir {
    map: Mutex<HashMap<usize, PageMapping>>,
}

impl FakePageDir {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// What the MMU does on a store: sets accessed and dirty.
    pub fn mark_write(&self, upage: usize) {
        let mut map = self.map.lock();
        let mapping = map.get_mut(&upage).expect("write to unmapped page");
        mapping.accessed = true;
        mapping.dirty = true;
    }

    /// What the MMU does on a load: sets accessed.
    pub fn mark_read(&self, upage: usize) {
        let mut map = self.map.lock();
        let mapping = map.get_mut(&upage).expect("read of unmapped page");
        mapping.accessed = true;
    }

    pub fn clear_accessed(&self, upage: usize) {
        self.set_accessed(upage, false);
    }

    pub fn is_writable(&self, upage: usize) -> bool {
        self.map.lock().get(&upage).map_or(false, |m| m.writable)
    }
}

impl UserPageTable for FakePageDir {
    fn map(&self, upage: usize, frame: usize, writable: bool) -> bool {
        let mut map = self.map.lock();
        assert!(!map.contains_key(&upage), "double mapping");
        map.insert(
            upage,
            PageMapping {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn unmap(&self, upage: usize) {
        self.map.lock().remove(&upage);
    }

    fn translate(&self, upage: usize) -> Option<usize> {
        self.map.lock().get(&upage).map(|m| m.frame)
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.map.lock().get(&upage).map_or(false, |m| m.accessed)
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        if let Some(mapping) = self.map.lock().get_mut(&upage) {
            mapping.accessed = accessed;
        }
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.map.lock().get(&upage).map_or(false, |m| m.dirty)
    }
}
