//! Demand paging.
//!
//! A user page is materialized at first fault and may afterwards move
//! between a frame, a swap slot, and its backing file. The pieces:
//!
//! * [`frame`]: the global frame table and clock victim selection.
//! * [`swap`]: page-sized slots on the swap device.
//! * [`page`]: per-process supplemental and executable page tables.
//! * [`fault`]: fault resolution and user-buffer pinning.
//! * [`mmap`]: memory-mapped files.
//!
//! [`Vm`] owns the global side (frames and swap) and implements the
//! eviction policy: a dirty mapped-file page is written back to its
//! file, a dirty anonymous page goes to swap, and a clean page is simply
//! dropped, to be recovered from its backing source on the next fault.

use alloc::sync::Arc;

use log::debug;

use crate::fs::FileSys;
use crate::hal::{AllocFlags, BlockDevice, FrameAllocator};
use crate::param::PGSIZE;
use crate::proc::Process;

pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;

pub use fault::{page_fault_handler, pin_user_range, unpin_all};
pub use frame::{FrameEntry, FrameTable};
pub use mmap::{mmap, munmap};
pub use page::{ExecPage, MmapInfo, PageLoc, SptEntry};
pub use swap::SwapDevice;

pub fn pg_round_down(va: usize) -> usize {
    va & !(PGSIZE - 1)
}

pub fn pg_round_up(va: usize) -> usize {
    (va + PGSIZE - 1) & !(PGSIZE - 1)
}

/// The bytes of a physical frame.
///
/// # Safety
///
/// `frame` must come from the frame allocator and stay alive (pinned or
/// otherwise unevictable) for the borrow's duration, with no concurrent
/// access to the same page.
pub(crate) unsafe fn frame_bytes<'a>(frame: usize) -> &'a mut [u8; PGSIZE] {
    &mut *(frame as *mut [u8; PGSIZE])
}

pub struct Vm {
    frames: FrameTable,
    swap: SwapDevice,
}

impl Vm {
    pub fn new(palloc: Arc<dyn FrameAllocator>, swap_dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            frames: FrameTable::new(palloc),
            swap: SwapDevice::new(swap_dev),
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapDevice {
        &self.swap
    }

    /// Obtains a frame for `owner`, evicting if the allocator is dry.
    /// Returns the frame's table entry, pinned, with no page installed
    /// yet.
    pub fn frame_alloc(
        &self,
        fs: &FileSys,
        owner: &Arc<Process>,
        flags: AllocFlags,
    ) -> Arc<FrameEntry> {
        loop {
            if let Some(frame) = self.frames.palloc().alloc(flags) {
                return self.frames.insert_pinned(frame, owner);
            }
            let victim = self.frames.choose_victim();
            self.resolve_victim(fs, &victim);
        }
    }

    /// Makes a chosen victim's frame reclaimable. The victim arrives
    /// pinned; its frame is freed by the time this returns.
    fn resolve_victim(&self, fs: &FileSys, victim: &Arc<FrameEntry>) {
        let entry = victim.aux().expect("victim without a page");
        let upage = entry.page();
        let pagedir = victim.owner().pagedir();

        if entry.is_mmap() {
            // Mapped-file pages never swap: a dirty one goes home to its
            // file, and either way the entry reverts to lazy so a later
            // fault re-reads the file.
            if pagedir.is_dirty(upage) {
                let (file, offset, read_bytes) = {
                    let info = entry.state.lock();
                    let mmap = info.mmap.as_ref().expect("mmap page without backing");
                    (Arc::clone(&mmap.file), mmap.offset, mmap.read_bytes)
                };
                debug!("vm: evict dirty mmap page {:#x} -> file offset {}", upage, offset);
                let bytes = unsafe { frame_bytes(victim.frame()) };
                file.write_at(fs, &bytes[..read_bytes], offset);
            }
            entry.state.lock().loc = PageLoc::Lazy;
            self.frames.remove(victim);
        } else if pagedir.is_dirty(upage) {
            let slot = self.swap.swap_out(victim.frame());
            entry.state.lock().loc = PageLoc::Swapped { slot };
            self.frames.remove(victim);
        } else {
            // Clean and anonymous: drop both frame and entry. The next
            // fault recovers the contents from the backing source, an
            // executable segment or fresh zeros.
            self.frames.remove(victim);
            victim.owner().spt_remove(&entry);
        }
    }

    /// Releases every page a dying process still owns: swap slots are
    /// freed unread, resident anonymous pages drop their frames. Nothing
    /// is written back anywhere; this runs only at teardown, after the
    /// process's mappings are gone, so no content needs to survive.
    pub fn spt_destroy(&self, process: &Arc<Process>) {
        for entry in process.spt_drain() {
            let (loc, is_mmap) = {
                let info = entry.state.lock();
                (info.loc, info.mmap.is_some())
            };
            match loc {
                PageLoc::Swapped { slot } => self.swap.delete(slot),
                PageLoc::Resident { frame } if !is_mmap => {
                    if let Some(fte) = self.frames.pin(frame) {
                        self.frames.remove(&fte);
                    }
                }
                _ => {}
            }
        }
    }

    /// Full paging-side teardown of an exiting process: live mappings are
    /// unmapped (with write-back), then the remaining pages and the
    /// executable image handle are released.
    pub fn process_exit(&self, fs: &FileSys, process: &Arc<Process>) {
        for region in process.take_all_mmaps() {
            mmap::munmap_region(self, fs, process, region);
        }
        self.spt_destroy(process);
        process.clear_exec_pages();
        if let Some(file) = process.take_exec_file() {
            if let Ok(file) = Arc::try_unwrap(file) {
                file.close(fs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSys;
    use crate::hal::{BlockDevice, FrameAllocator, UserPageTable};
    use crate::param::{PGSIZE, PHYS_BASE};
    use crate::test_util::{FakePageDir, MemDisk, TestPalloc};
    use std::sync::Arc;
    use std::vec;
    use std::vec::Vec;

    struct Rig {
        fs: Arc<FileSys>,
        vm: Arc<Vm>,
        process: Arc<Process>,
        pagedir: Arc<FakePageDir>,
        palloc: Arc<TestPalloc>,
    }

    fn rig(frames: usize) -> Rig {
        let disk = Arc::new(MemDisk::new(4096));
        let fs = Arc::new(FileSys::mount(disk as Arc<dyn BlockDevice>, true));
        let palloc = TestPalloc::new(frames);
        let swap_disk = Arc::new(MemDisk::new(1024));
        let vm = Arc::new(Vm::new(
            palloc.clone() as Arc<dyn FrameAllocator>,
            swap_disk as Arc<dyn BlockDevice>,
        ));
        let pagedir = Arc::new(FakePageDir::new());
        let process = Process::new(pagedir.clone() as Arc<dyn crate::hal::UserPageTable>);
        Rig {
            fs,
            vm,
            process,
            pagedir,
            palloc,
        }
    }

    const STACK_TOP: usize = PHYS_BASE - 64 * PGSIZE;

    /// Faults `upage` in as a stack page and writes `marker` into it,
    /// setting the hardware bits the way real stores would.
    fn touch_stack_page(r: &Rig, upage: usize, marker: u32) {
        let esp = upage;
        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, upage, esp).expect("stack fault");
        let bytes = unsafe { frame_bytes(fte.frame()) };
        bytes[..4].copy_from_slice(&marker.to_le_bytes());
        r.pagedir.mark_write(upage);
        fte.unpin();
    }

    /// Reads the first word of `upage`, faulting it back in if needed.
    fn read_word(r: &Rig, upage: usize) -> u32 {
        let frame = match r.pagedir.translate(upage) {
            Some(frame) => frame,
            None => {
                let fte =
                    page_fault_handler(&r.vm, &r.fs, &r.process, upage, upage).expect("refault");
                let frame = fte.frame();
                fte.unpin();
                frame
            }
        };
        let bytes = unsafe { frame_bytes(frame) };
        r.pagedir.mark_read(upage);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn stack_growth_installs_zeroed_writable_page() {
        let r = rig(4);
        let upage = STACK_TOP;
        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, upage + 12, upage).unwrap();
        let bytes = unsafe { frame_bytes(fte.frame()) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(r.pagedir.translate(upage), Some(fte.frame()));
        assert!(r.process.spt_lookup(upage).is_some());
        fte.unpin();
    }

    #[test]
    fn fault_far_below_stack_pointer_is_rejected() {
        let r = rig(4);
        let esp = STACK_TOP;
        assert!(page_fault_handler(&r.vm, &r.fs, &r.process, esp - PGSIZE, esp).is_err());
        // Kernel addresses never resolve.
        assert!(page_fault_handler(&r.vm, &r.fs, &r.process, PHYS_BASE + 4, esp).is_err());
        assert!(page_fault_handler(&r.vm, &r.fs, &r.process, 0, esp).is_err());
    }

    #[test]
    fn swap_round_trip_under_memory_pressure() {
        let r = rig(4);
        let pages = 12usize;

        // More dirty pages than frames: the tail of the loop forces the
        // head out to swap.
        for i in 0..pages {
            touch_stack_page(&r, STACK_TOP + i * PGSIZE, 0xbeef_0000 + i as u32);
        }
        assert!(r.vm.swap().used_sectors() > 0);

        // Every marker survives the trip out and back.
        for i in 0..pages {
            assert_eq!(
                read_word(&r, STACK_TOP + i * PGSIZE),
                0xbeef_0000 + i as u32,
                "page {}",
                i
            );
        }
    }

    #[test]
    fn eviction_prefers_unaccessed_pages() {
        let r = rig(2);
        touch_stack_page(&r, STACK_TOP, 1);
        touch_stack_page(&r, STACK_TOP + PGSIZE, 2);
        // Re-touch the first page so its accessed bit is set; the clock
        // must pass it over once.
        r.pagedir.mark_read(STACK_TOP);
        r.pagedir.clear_accessed(STACK_TOP + PGSIZE);

        touch_stack_page(&r, STACK_TOP + 2 * PGSIZE, 3);
        assert!(
            r.pagedir.translate(STACK_TOP).is_some(),
            "recently accessed page was evicted"
        );
        assert!(r.pagedir.translate(STACK_TOP + PGSIZE).is_none());
    }

    #[test]
    fn exec_pages_lazy_load_segment_and_bss() {
        let r = rig(4);
        let root = r.fs.open_root();
        assert!(r.fs.create(&root, "prog", 0));
        let image = r.fs.open(&root, "prog").unwrap();
        let mut segment = vec![0u8; 3000];
        for (i, b) in segment.iter_mut().enumerate() {
            *b = (i % 199) as u8;
        }
        assert_eq!(image.write_at(&r.fs, &segment, 0), 3000);
        image.deny_write();
        r.process.set_exec_file(image);

        let upage = 0x40_0000;
        r.process.register_exec_page(
            upage,
            ExecPage {
                offset: 0,
                read_bytes: 3000,
                zero_bytes: PGSIZE - 3000,
                writable: false,
            },
        );

        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, upage + 100, STACK_TOP).unwrap();
        let bytes = unsafe { frame_bytes(fte.frame()) };
        assert_eq!(&bytes[..3000], &segment[..]);
        assert!(bytes[3000..].iter().all(|&b| b == 0), "bss tail not zeroed");
        assert!(!r.pagedir.is_writable(upage));
        fte.unpin();

        root.close(&r.fs);
    }

    #[test]
    fn clean_exec_page_is_dropped_and_reloaded() {
        let r = rig(2);
        let root = r.fs.open_root();
        assert!(r.fs.create(&root, "prog2", 0));
        let image = r.fs.open(&root, "prog2").unwrap();
        assert_eq!(image.write_at(&r.fs, &[0x77; 512], 0), 512);
        r.process.set_exec_file(image);

        let upage = 0x40_0000;
        r.process.register_exec_page(
            upage,
            ExecPage {
                offset: 0,
                read_bytes: 512,
                zero_bytes: PGSIZE - 512,
                writable: false,
            },
        );

        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, upage, STACK_TOP).unwrap();
        fte.unpin();
        // Never dirtied: pressure drops the page instead of swapping it.
        touch_stack_page(&r, STACK_TOP, 1);
        touch_stack_page(&r, STACK_TOP + PGSIZE, 2);
        assert_eq!(r.vm.swap().used_sectors(), 0);
        assert!(r.pagedir.translate(upage).is_none());
        assert!(r.process.spt_lookup(upage).is_none());

        // The next fault reloads from the image.
        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, upage, STACK_TOP).unwrap();
        let bytes = unsafe { frame_bytes(fte.frame()) };
        assert_eq!(&bytes[..8], &[0x77; 8]);
        fte.unpin();
        root.close(&r.fs);
    }

    #[test]
    fn mmap_write_back_on_munmap() {
        let r = rig(8);
        let root = r.fs.open_root();
        assert!(r.fs.create(&root, "mapped", 3 * PGSIZE));
        let file = r.fs.open(&root, "mapped").unwrap();
        let before: Vec<u8> = vec![0u8; 3 * PGSIZE];

        let addr = 0x50_0000;
        let mapid = mmap(&r.process, &file, addr).unwrap();

        // Dirty only the middle page.
        let fte =
            page_fault_handler(&r.vm, &r.fs, &r.process, addr + PGSIZE, STACK_TOP).unwrap();
        let bytes = unsafe { frame_bytes(fte.frame()) };
        bytes.fill(0xcd);
        r.pagedir.mark_write(addr + PGSIZE);
        fte.unpin();
        // Page 0 is only read.
        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, addr, STACK_TOP).unwrap();
        r.pagedir.mark_read(addr);
        fte.unpin();

        munmap(&r.vm, &r.fs, &r.process, mapid).unwrap();

        let mut after = vec![0u8; 3 * PGSIZE];
        assert_eq!(file.read_at(&r.fs, &mut after, 0), 3 * PGSIZE);
        assert_eq!(&after[..PGSIZE], &before[..PGSIZE], "page 0 modified");
        assert!(after[PGSIZE..2 * PGSIZE].iter().all(|&b| b == 0xcd));
        assert_eq!(&after[2 * PGSIZE..], &before[2 * PGSIZE..], "page 2 modified");

        // All table entries and mappings are gone.
        for i in 0..3 {
            assert!(r.process.spt_lookup(addr + i * PGSIZE).is_none());
            assert!(r.pagedir.translate(addr + i * PGSIZE).is_none());
        }
        assert!(munmap(&r.vm, &r.fs, &r.process, mapid).is_err());

        file.close(&r.fs);
        root.close(&r.fs);
    }

    #[test]
    fn mmap_rejects_bad_placement() {
        let r = rig(4);
        let root = r.fs.open_root();
        assert!(r.fs.create(&root, "m", PGSIZE));
        let file = r.fs.open(&root, "m").unwrap();

        assert!(mmap(&r.process, &file, 0).is_err());
        assert!(mmap(&r.process, &file, 0x1234).is_err());
        assert!(mmap(&r.process, &file, PHYS_BASE).is_err());

        // Overlap with an existing page is refused.
        touch_stack_page(&r, STACK_TOP, 7);
        assert!(mmap(&r.process, &file, STACK_TOP).is_err());

        // Empty files are unmappable.
        assert!(r.fs.create(&root, "empty", 0));
        let empty = r.fs.open(&root, "empty").unwrap();
        assert!(mmap(&r.process, &empty, 0x60_0000).is_err());

        empty.close(&r.fs);
        file.close(&r.fs);
        root.close(&r.fs);
    }

    #[test]
    fn dirty_mmap_page_evicts_to_file_not_swap() {
        let r = rig(2);
        let root = r.fs.open_root();
        assert!(r.fs.create(&root, "evictmap", PGSIZE));
        let file = r.fs.open(&root, "evictmap").unwrap();

        let addr = 0x70_0000;
        let mapid = mmap(&r.process, &file, addr).unwrap();
        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, addr, STACK_TOP).unwrap();
        unsafe { frame_bytes(fte.frame()) }.fill(0x3c);
        r.pagedir.mark_write(addr);
        r.pagedir.clear_accessed(addr);
        fte.unpin();

        // Pressure: the mapped page is the only unaccessed one, so the
        // clock takes it first.
        touch_stack_page(&r, STACK_TOP, 1);
        touch_stack_page(&r, STACK_TOP + PGSIZE, 2);

        assert!(r.pagedir.translate(addr).is_none(), "mmap page survived pressure");
        let mut on_disk = vec![0u8; 64];
        assert_eq!(file.read_at(&r.fs, &mut on_disk, 0), 64);
        assert!(on_disk.iter().all(|&b| b == 0x3c), "write-back missed the file");

        // Faulting it again re-reads the file contents.
        let fte = page_fault_handler(&r.vm, &r.fs, &r.process, addr, STACK_TOP).unwrap();
        let bytes = unsafe { frame_bytes(fte.frame()) };
        assert_eq!(bytes[123], 0x3c);
        fte.unpin();

        munmap(&r.vm, &r.fs, &r.process, mapid).unwrap();
        file.close(&r.fs);
        root.close(&r.fs);
    }

    #[test]
    fn process_exit_releases_swap_frames_and_mappings() {
        let r = rig(3);
        let root = r.fs.open_root();
        assert!(r.fs.create(&root, "exitmap", PGSIZE));
        let file = r.fs.open(&root, "exitmap").unwrap();
        let mapid = mmap(&r.process, &file, 0x80_0000).unwrap();
        let _ = mapid;
        file.close(&r.fs);
        root.close(&r.fs);

        for i in 0..8 {
            touch_stack_page(&r, STACK_TOP + i * PGSIZE, i as u32);
        }
        assert!(r.vm.swap().used_sectors() > 0);
        assert!(r.vm.frames().len() > 0);

        r.vm.process_exit(&r.fs, &r.process);

        assert_eq!(r.vm.swap().used_sectors(), 0);
        assert_eq!(r.vm.frames().len(), 0);
        assert_eq!(r.palloc.outstanding(), 0);
    }

    #[test]
    fn pin_user_range_faults_in_and_pins() {
        let r = rig(4);
        let base = STACK_TOP;
        let len = 2 * PGSIZE + 100;
        let pinned = pin_user_range(&r.vm, &r.fs, &r.process, base + 50, len, base).unwrap();
        assert_eq!(pinned.len(), 3);
        // While pinned, pressure cannot steal these frames.
        touch_stack_page(&r, STACK_TOP + 16 * PGSIZE, 1);
        touch_stack_page(&r, STACK_TOP + 17 * PGSIZE, 2);
        touch_stack_page(&r, STACK_TOP + 18 * PGSIZE, 3);
        for (i, fte) in pinned.iter().enumerate() {
            assert_eq!(
                r.pagedir.translate(base + i * PGSIZE),
                Some(fte.frame()),
                "pinned page {} was moved",
                i
            );
        }
        unpin_all(&pinned);

        // An unmappable range reports failure and pins nothing.
        assert!(pin_user_range(&r.vm, &r.fs, &r.process, PHYS_BASE - PGSIZE, 2 * PGSIZE, base)
            .is_err());
    }
}
