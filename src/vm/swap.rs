//! Swap slot management.
//!
//! The swap device is carved into 8-sector, page-sized slots tracked by a
//! sector-granularity bitmap. Slots are single use: swapping a page back
//! in frees its slot, and a process exiting with pages still swapped out
//! frees them without the read. Running out of swap is fatal; there is
//! nowhere left to put the page.

use alloc::sync::Arc;
use core::convert::TryInto;

use log::debug;
use spin::Mutex;

use crate::bitmap::Bitmap;
use crate::hal::BlockDevice;
use crate::param::{BLOCK_SECTOR_SIZE, SECTORS_PER_PAGE};
use crate::vm::frame_bytes;

pub struct SwapDevice {
    dev: Arc<dyn BlockDevice>,
    map: Mutex<Bitmap>,
}

impl SwapDevice {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let sectors = dev.sector_count() as usize;
        Self {
            dev,
            map: Mutex::new(Bitmap::new(sectors)),
        }
    }

    /// Writes the page in `frame` to a fresh slot and returns the slot's
    /// first sector. Panics when the swap device is full.
    pub fn swap_out(&self, frame: usize) -> usize {
        let slot = self
            .map
            .lock()
            .scan_and_flip(0, SECTORS_PER_PAGE, false)
            .expect("out of swap slots");

        // The caller pins the frame; the page cannot vanish mid-write.
        let bytes = unsafe { frame_bytes(frame) };
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &[u8; BLOCK_SECTOR_SIZE] = bytes
                [i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE]
                .try_into()
                .unwrap();
            self.dev.sector_write((slot + i) as u32, chunk);
        }
        debug!("vm: frame {:#x} swapped out to slot {}", frame, slot);
        slot
    }

    /// Reads the slot starting at sector `slot` back into `frame` and
    /// frees it.
    pub fn swap_in(&self, frame: usize, slot: usize) {
        let bytes = unsafe { frame_bytes(frame) };
        let mut map = self.map.lock();
        for i in 0..SECTORS_PER_PAGE {
            assert!(map.test(slot + i), "swap-in of a free slot");
            let chunk: &mut [u8; BLOCK_SECTOR_SIZE] = (&mut bytes
                [i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.dev.sector_read((slot + i) as u32, chunk);
            map.set(slot + i, false);
        }
        debug!("vm: slot {} swapped in to frame {:#x}", slot, frame);
    }

    /// Frees the slot without reading it; for pages discarded at process
    /// exit.
    pub fn delete(&self, slot: usize) {
        let mut map = self.map.lock();
        for i in 0..SECTORS_PER_PAGE {
            map.set(slot + i, false);
        }
    }

    /// Sectors currently holding swapped pages.
    pub fn used_sectors(&self) -> usize {
        self.map.lock().count(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PGSIZE;
    use crate::test_util::{MemDisk, TestPalloc};
    use crate::hal::{AllocFlags, FrameAllocator};
    use std::sync::Arc;

    #[test]
    fn round_trip_preserves_page_bytes() {
        let swap = SwapDevice::new(Arc::new(MemDisk::new(64)));
        let palloc = TestPalloc::new(2);
        let a = palloc.alloc(AllocFlags::USER).unwrap();
        let b = palloc.alloc(AllocFlags::USER).unwrap();

        let src = unsafe { frame_bytes(a) };
        for (i, byte) in src.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let slot = swap.swap_out(a);
        assert_eq!(swap.used_sectors(), SECTORS_PER_PAGE);

        swap.swap_in(b, slot);
        assert_eq!(swap.used_sectors(), 0);
        let dst = unsafe { frame_bytes(b) };
        for i in 0..PGSIZE {
            assert_eq!(dst[i], (i % 251) as u8, "byte {}", i);
        }

        palloc.free(a);
        palloc.free(b);
    }

    #[test]
    fn slots_allocate_densely_and_delete_frees() {
        let swap = SwapDevice::new(Arc::new(MemDisk::new(32)));
        let palloc = TestPalloc::new(1);
        let frame = palloc.alloc(AllocFlags::ZERO).unwrap();

        let s0 = swap.swap_out(frame);
        let s1 = swap.swap_out(frame);
        let s2 = swap.swap_out(frame);
        assert_eq!((s0, s1, s2), (0, 8, 16));

        swap.delete(s1);
        assert_eq!(swap.swap_out(frame), 8);

        palloc.free(frame);
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn exhaustion_is_fatal() {
        let swap = SwapDevice::new(Arc::new(MemDisk::new(8)));
        let palloc = TestPalloc::new(1);
        let frame = palloc.alloc(AllocFlags::ZERO).unwrap();
        swap.swap_out(frame);
        swap.swap_out(frame);
    }
}
