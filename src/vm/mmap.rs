//! Memory-mapped files.
//!
//! Mapping installs one lazily-materialized supplemental-page-table entry
//! per file page; nothing is read until the first fault. Unmapping writes
//! modified pages (per the hardware dirty bit) back to the file, releases
//! any resident frames, and drops the entries. Pages never faulted in
//! are skipped entirely: their dirty bit cannot be set.

use alloc::sync::Arc;

use log::{debug, trace};

use crate::file::File;
use crate::fs::FileSys;
use crate::param::{PGSIZE, PHYS_BASE};
use crate::proc::{MmapRegion, Process};
use crate::vm::page::{MmapInfo, PageLoc, SptEntry};
use crate::vm::Vm;

/// Maps `file` at page-aligned user address `addr`. The whole range must
/// be unused: no supplemental or executable page may overlap it. Returns
/// the process-local mapping id.
pub fn mmap(process: &Arc<Process>, file: &File, addr: usize) -> Result<i32, ()> {
    if addr == 0 || addr % PGSIZE != 0 {
        return Err(());
    }
    if file.inode().is_dir() {
        return Err(());
    }
    let length = file.len();
    if length == 0 || addr.checked_add(length).ok_or(())? > PHYS_BASE {
        return Err(());
    }
    for upage in (addr..addr + length).step_by(PGSIZE) {
        if process.spt_lookup(upage).is_some() || process.exec_page_lookup(upage).is_some() {
            return Err(());
        }
    }

    // A private reopen: the mapping's I/O position is independent of the
    // descriptor the caller passed in.
    let file = Arc::new(file.reopen());

    let mut offset = 0;
    let mut left = length;
    for upage in (addr..addr + length).step_by(PGSIZE) {
        let read_bytes = left.min(PGSIZE);
        let entry = SptEntry::new_mmap(
            upage,
            MmapInfo {
                file: Arc::clone(&file),
                offset,
                read_bytes,
                zero_bytes: PGSIZE - read_bytes,
            },
        );
        process.spt_insert_entry(Arc::new(entry));
        left -= read_bytes;
        offset += PGSIZE;
    }

    let mapid = process.add_mmap(file, addr, length);
    debug!("vm: mmap id {} at {:#x}, {} bytes", mapid, addr, length);
    Ok(mapid)
}

/// Tears down mapping `mapid`, writing dirty pages back to the file.
pub fn munmap(vm: &Vm, fs: &FileSys, process: &Arc<Process>, mapid: i32) -> Result<(), ()> {
    let region = process.take_mmap(mapid).ok_or(())?;
    munmap_region(vm, fs, process, region);
    Ok(())
}

pub(crate) fn munmap_region(vm: &Vm, fs: &FileSys, process: &Arc<Process>, region: MmapRegion) {
    for upage in (region.addr..region.addr + region.length).step_by(PGSIZE) {
        let entry = process
            .spt_lookup(upage)
            .expect("mapped page without table entry");

        if let PageLoc::Resident { frame } = entry.loc() {
            if let Some(fte) = vm.frames().pin(frame) {
                // Dirtiness comes from the hardware bit alone; a page
                // only read since its fault goes back silently.
                if process.pagedir().is_dirty(upage) {
                    let (file, offset, read_bytes) = {
                        let info = entry.state.lock();
                        let mmap = info.mmap.as_ref().expect("mapped page without backing");
                        (Arc::clone(&mmap.file), mmap.offset, mmap.read_bytes)
                    };
                    trace!("vm: munmap write back page {:#x} -> offset {}", upage, offset);
                    let bytes = unsafe { crate::vm::frame_bytes(frame) };
                    file.write_at(fs, &bytes[..read_bytes], offset);
                }
                vm.frames().remove(&fte);
            }
        }

        process.spt_remove(&entry);
    }

    // The reopen is ours alone once the entries are gone.
    if let Ok(file) = Arc::try_unwrap(region.file) {
        file.close(fs);
    }
}
