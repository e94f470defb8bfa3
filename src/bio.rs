//! Buffer cache.
//!
//! A fixed array of 64 slots holding cached copies of disk sectors.
//! Caching reduces the number of device round trips and gives every sector
//! a single synchronization point: all reads and writes of one sector go
//! through the slot that holds it, serialized by that slot's lock.
//!
//! Interface:
//! * `read_at` / `write_at` copy bytes out of or into the slot holding a
//!   sector, loading it from disk on a miss. Writes only mark the slot
//!   dirty; data reaches the device on eviction, removal, or shutdown.
//! * `remove` scrubs a sector whose backing block is being freed so a
//!   later reuse cannot observe stale contents.
//! * `shutdown` flushes every dirty slot and stops the read-ahead worker.
//!
//! Slot identity (which sector a slot holds) changes only under the global
//! cache lock; slot contents change only under the slot lock. Eviction is
//! a clock scan: an accessed slot gets a second chance, a locked slot is
//! skipped, and a dirty victim is written back before its slot is reused.
//!
//! A sequential read also queues the next sector for a long-lived
//! read-ahead worker. The worker is best effort: a full queue drops the
//! request and costs only the optimization.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use array_macro::array;
use arrayvec::ArrayVec;
use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use crate::hal::BlockDevice;
use crate::param::{BLOCK_SECTOR_SIZE, NBUF};
use crate::sync::{relax, Semaphore};

static ZERO_SECTOR: [u8; BLOCK_SECTOR_SIZE] = [0; BLOCK_SECTOR_SIZE];

/// One sector's worth of cached bytes.
///
/// Index blocks are read in place as `u32`s, so the buffer keeps 4-byte
/// alignment.
#[repr(align(4))]
pub struct SectorBuf(pub [u8; BLOCK_SECTOR_SIZE]);

impl SectorBuf {
    const fn new() -> Self {
        Self([0; BLOCK_SECTOR_SIZE])
    }
}

struct Slot {
    /// Which sector this slot holds. Meaningful only while the control
    /// block marks the slot valid; updated only under the cache lock.
    sector: AtomicU32,

    /// Touched since the clock hand last passed.
    accessed: AtomicBool,

    /// Has the sector been read from (or fully overwritten in) memory?
    loaded: AtomicBool,

    /// Does the buffer differ from the device?
    dirty: AtomicBool,

    data: Mutex<SectorBuf>,
}

impl Slot {
    fn new() -> Self {
        Self {
            sector: AtomicU32::new(0),
            accessed: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            data: Mutex::new(SectorBuf::new()),
        }
    }
}

/// Slot identity and the clock hand, all guarded by the cache lock.
struct Ctl {
    valid: [bool; NBUF],
    cursor: usize,
}

struct ReadAhead {
    /// Indexes of slots waiting to be loaded. Bounded; a failed push is
    /// dropped silently.
    queue: Mutex<ArrayVec<usize, NBUF>>,
    pending: Semaphore,
    shutdown: AtomicBool,
}

pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
    ctl: Mutex<Ctl>,
    slots: [Slot; NBUF],
    readahead: ReadAhead,
}

impl BufCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            ctl: Mutex::new(Ctl {
                valid: [false; NBUF],
                cursor: 0,
            }),
            slots: array![_ => Slot::new(); NBUF],
            readahead: ReadAhead {
                queue: Mutex::new(ArrayVec::new()),
                pending: Semaphore::new(0),
                shutdown: AtomicBool::new(false),
            },
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Finds the slot holding `sector`, or claims one for it (data not yet
    /// loaded). Returns the slot index with its lock held.
    fn allocate(&self, sector: u32) -> (usize, MutexGuard<'_, SectorBuf>) {
        let mut ctl = self.ctl.lock();

        let mut free = None;
        for idx in 0..NBUF {
            if ctl.valid[idx] {
                if self.slots[idx].sector.load(Ordering::Relaxed) == sector {
                    // Anyone holding a slot lock releases it without
                    // touching the cache lock, so blocking here keeps the
                    // cache lock -> slot lock order acyclic.
                    let guard = self.slots[idx].data.lock();
                    return (idx, guard);
                }
            } else if free.is_none() {
                free = Some(idx);
            }
        }

        let (idx, guard) = match free {
            Some(idx) => (idx, self.slots[idx].data.lock()),
            None => self.evict(&mut ctl),
        };

        let slot = &self.slots[idx];
        slot.sector.store(sector, Ordering::Relaxed);
        slot.accessed.store(false, Ordering::Relaxed);
        slot.loaded.store(false, Ordering::Relaxed);
        slot.dirty.store(false, Ordering::Relaxed);
        ctl.valid[idx] = true;
        (idx, guard)
    }

    /// Clock eviction. Called with the cache lock held and every slot
    /// valid; returns a victim slot with its lock held and its old
    /// contents written back.
    fn evict<'s>(&'s self, ctl: &mut Ctl) -> (usize, MutexGuard<'s, SectorBuf>) {
        loop {
            for idx in ctl.cursor..NBUF {
                debug_assert!(ctl.valid[idx]);
                let slot = &self.slots[idx];
                if slot.accessed.load(Ordering::Relaxed) {
                    slot.accessed.store(false, Ordering::Relaxed);
                } else if slot.loaded.load(Ordering::Relaxed) {
                    // A held lock means the slot is mid-I/O; skip it.
                    if let Some(guard) = slot.data.try_lock() {
                        ctl.cursor = idx + 1;
                        if slot.dirty.swap(false, Ordering::Relaxed) {
                            let sector = slot.sector.load(Ordering::Relaxed);
                            trace!("bio: write back sector {} from slot {}", sector, idx);
                            self.dev.sector_write(sector, &guard.0);
                        }
                        debug!("bio: evict slot {}", idx);
                        return (idx, guard);
                    }
                }
            }
            ctl.cursor = 0;
            // Nothing evictable this pass; give lock holders a chance to
            // finish.
            relax();
        }
    }

    /// Reads the sector into the slot. Slot lock held by the caller.
    fn load(&self, idx: usize, guard: &mut SectorBuf) {
        let slot = &self.slots[idx];
        guard.0.fill(0);
        self.dev
            .sector_read(slot.sector.load(Ordering::Relaxed), &mut guard.0);
        slot.loaded.store(true, Ordering::Relaxed);
    }

    /// Copies `dst.len()` bytes out of `sector` starting at byte `ofs`.
    /// Also queues `sector + 1` for read-ahead when it exists.
    pub fn read_at(&self, sector: u32, dst: &mut [u8], ofs: usize) {
        assert!(ofs + dst.len() <= BLOCK_SECTOR_SIZE);

        let (idx, mut guard) = self.allocate(sector);
        let slot = &self.slots[idx];
        if !slot.loaded.load(Ordering::Relaxed) {
            self.load(idx, &mut guard);
        }
        dst.copy_from_slice(&guard.0[ofs..ofs + dst.len()]);
        slot.accessed.store(true, Ordering::Relaxed);
        drop(guard);

        if sector + 1 < self.dev.sector_count() {
            let (next, guard) = self.allocate(sector + 1);
            if !self.slots[next].loaded.load(Ordering::Relaxed) {
                self.enqueue_read_ahead(next);
            }
            drop(guard);
        }
    }

    /// Copies `src` into `sector` starting at byte `ofs` and marks the
    /// slot dirty. A partial write of a not-yet-loaded slot reads the
    /// sector first; a full-sector write skips the read.
    pub fn write_at(&self, sector: u32, src: &[u8], ofs: usize) {
        assert!(ofs + src.len() <= BLOCK_SECTOR_SIZE);

        let (idx, mut guard) = self.allocate(sector);
        let slot = &self.slots[idx];
        if !slot.loaded.load(Ordering::Relaxed) {
            if src.len() == BLOCK_SECTOR_SIZE {
                slot.loaded.store(true, Ordering::Relaxed);
            } else {
                self.load(idx, &mut guard);
            }
        }
        guard.0[ofs..ofs + src.len()].copy_from_slice(src);
        slot.dirty.store(true, Ordering::Relaxed);
        slot.accessed.store(true, Ordering::Relaxed);
    }

    /// Scrubs `sector` from the cache: zeroes it in memory and on disk and
    /// invalidates the slot. Called when the sector is released to the
    /// free map, so a later allocation starts from zeros.
    pub fn remove(&self, sector: u32) {
        let mut ctl = self.ctl.lock();
        for idx in 0..NBUF {
            let slot = &self.slots[idx];
            if ctl.valid[idx]
                && slot.sector.load(Ordering::Relaxed) == sector
                && slot.loaded.load(Ordering::Relaxed)
            {
                let mut guard = slot.data.lock();
                guard.0.fill(0);
                self.dev.sector_write(sector, &guard.0);
                ctl.valid[idx] = false;
                slot.loaded.store(false, Ordering::Relaxed);
                slot.dirty.store(false, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Flushes every dirty slot and stops the read-ahead worker. Called
    /// once at shutdown.
    pub fn shutdown(&self) {
        let ctl = self.ctl.lock();
        let mut flushed = 0;
        for idx in 0..NBUF {
            let slot = &self.slots[idx];
            if ctl.valid[idx]
                && slot.loaded.load(Ordering::Relaxed)
                && slot.dirty.load(Ordering::Relaxed)
            {
                let guard = slot.data.lock();
                self.dev
                    .sector_write(slot.sector.load(Ordering::Relaxed), &guard.0);
                slot.dirty.store(false, Ordering::Relaxed);
                flushed += 1;
            }
        }
        drop(ctl);
        debug!("bio: shutdown flushed {} slots", flushed);

        self.readahead.shutdown.store(true, Ordering::Release);
        self.readahead.pending.up();
    }

    fn enqueue_read_ahead(&self, idx: usize) {
        let mut queue = self.readahead.queue.lock();
        let was_empty = queue.is_empty();
        if queue.try_push(idx).is_ok() && was_empty {
            self.readahead.pending.up();
        }
    }

    /// Body of the read-ahead worker. The embedding kernel runs this on a
    /// dedicated thread; it returns after [`BufCache::shutdown`].
    pub fn read_ahead_worker(&self) {
        loop {
            if self.readahead.queue.lock().is_empty() {
                self.readahead.pending.down();
            }
            if self.readahead.shutdown.load(Ordering::Acquire) {
                return;
            }

            loop {
                let idx = {
                    let mut queue = self.readahead.queue.lock();
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                };
                let idx = match idx {
                    Some(idx) => idx,
                    None => break,
                };

                let mut guard = self.slots[idx].data.lock();
                if !self.slots[idx].loaded.load(Ordering::Relaxed) {
                    trace!(
                        "bio: read ahead sector {}",
                        self.slots[idx].sector.load(Ordering::Relaxed)
                    );
                    self.load(idx, &mut guard);
                }
            }
        }
    }
}

/// A zeroed sector image, for initializing freshly allocated blocks.
pub(crate) fn zero_sector() -> &'static [u8; BLOCK_SECTOR_SIZE] {
    &ZERO_SECTOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::BlockDevice;
    use crate::test_util::MemDisk;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    fn cache_over(sectors: u32) -> (Arc<BufCache>, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = Arc::new(BufCache::new(disk.clone() as Arc<dyn BlockDevice>));
        (cache, disk)
    }

    #[test]
    fn write_then_flush_reaches_disk() {
        let (cache, disk) = cache_over(16);
        let payload = [0xabu8; 100];
        cache.write_at(3, &payload, 7);
        // Not yet on disk: write-back cache.
        assert_eq!(disk.peek(3)[7], 0);
        cache.shutdown();
        assert_eq!(&disk.peek(3)[7..107], &payload[..]);
    }

    #[test]
    fn read_returns_written_bytes() {
        let (cache, _disk) = cache_over(16);
        cache.write_at(5, b"hello sector", 40);
        let mut out = [0u8; 12];
        cache.read_at(5, &mut out, 40);
        assert_eq!(&out, b"hello sector");
    }

    #[test]
    fn eviction_over_full_cache_preserves_data() {
        let total = (NBUF + 16) as u32;
        let (cache, disk) = cache_over(total + 1);
        for sector in 0..total {
            let byte = sector as u8;
            cache.write_at(sector, &[byte; BLOCK_SECTOR_SIZE], 0);
        }
        // More sectors than slots: every slot was reused at least once.
        for sector in 0..total {
            let mut out = [0u8; 4];
            cache.read_at(sector, &mut out, 100);
            assert_eq!(out, [sector as u8; 4], "sector {}", sector);
        }
        cache.shutdown();
        for sector in 0..total {
            assert_eq!(
                disk.peek(sector),
                [sector as u8; BLOCK_SECTOR_SIZE],
                "sector {}",
                sector
            );
        }
    }

    #[test]
    fn remove_scrubs_sector() {
        let (cache, disk) = cache_over(16);
        cache.write_at(9, &[0xff; BLOCK_SECTOR_SIZE], 0);
        cache.remove(9);
        assert_eq!(disk.peek(9), [0; BLOCK_SECTOR_SIZE]);
        // The slot is gone; a fresh read comes from (zeroed) disk.
        let mut out = [0xa5u8; 8];
        cache.read_at(9, &mut out, 0);
        assert_eq!(out, [0; 8]);
    }

    #[test]
    fn read_ahead_loads_successor() {
        let (cache, disk) = cache_over(16);
        disk.poke(8, &[0x5a; BLOCK_SECTOR_SIZE]);

        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.read_ahead_worker())
        };

        let mut out = [0u8; 1];
        cache.read_at(7, &mut out, 0);

        // The worker's load of sector 8 shows up as a device read.
        let mut spun = 0;
        while disk.reads_of(8) == 0 && spun < 2000 {
            thread::sleep(Duration::from_millis(1));
            spun += 1;
        }
        assert!(disk.reads_of(8) > 0, "read-ahead never loaded sector 8");

        cache.shutdown();
        worker.join().unwrap();

        // And a subsequent cached read needs no further device I/O.
        let before = disk.reads_of(8);
        let mut out = [0u8; 2];
        cache.read_at(8, &mut out, 0);
        assert_eq!(out, [0x5a; 2]);
        assert_eq!(disk.reads_of(8), before);
    }

    #[test]
    fn concurrent_writers_to_disjoint_sectors() {
        let (cache, disk) = cache_over(256);
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..50u32 {
                    let sector = t * 50 + i;
                    let byte = (sector % 251) as u8;
                    cache.write_at(sector, &[byte; BLOCK_SECTOR_SIZE], 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        cache.shutdown();
        for sector in 0..200u32 {
            let byte = (sector % 251) as u8;
            assert_eq!(disk.peek(sector), [byte; BLOCK_SECTOR_SIZE], "sector {}", sector);
        }
    }
}
