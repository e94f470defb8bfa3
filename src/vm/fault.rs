//! Page fault resolution.
//!
//! A fault is resolved against, in order: the supplemental page table
//! (swapped-out page, or a memory-mapped page not yet materialized), the
//! executable page table (lazy code/data load), and finally the stack
//! growth heuristic. Anything else is a bad access and the caller kills
//! the process. The resolved frame comes back pinned so syscalls can
//! hold user buffers in memory across kernel file I/O; the caller unpins
//! when done.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::trace;

use crate::fs::FileSys;
use crate::hal::AllocFlags;
use crate::param::{PGSIZE, PHYS_BASE, STACK_MAX, STACK_SLOP};
use crate::proc::Process;
use crate::vm::frame::FrameEntry;
use crate::vm::page::{PageLoc, SptEntry};
use crate::vm::{frame_bytes, pg_round_down, pg_round_up, Vm};

/// Does a fault at `va` with stack pointer `esp` look like the stack
/// growing? Pushes may touch slightly below the stack pointer.
fn is_stack_growth(va: usize, esp: usize) -> bool {
    va >= esp.saturating_sub(STACK_SLOP) && PHYS_BASE - pg_round_down(va) <= STACK_MAX
}

/// Installs a brand-new page: maps it and records it in the owner's
/// supplemental page table.
fn install_page(
    process: &Arc<Process>,
    fte: &Arc<FrameEntry>,
    upage: usize,
    writable: bool,
) -> Arc<SptEntry> {
    debug_assert!(process.pagedir().translate(upage).is_none());
    assert!(
        process.pagedir().map(upage, fte.frame(), writable),
        "page table exhausted"
    );
    let entry = process.spt_insert(upage, fte.frame(), writable);
    fte.set_aux(Arc::clone(&entry));
    entry
}

/// Resolves a user fault at `fault_addr`. On success the backing frame
/// is returned pinned. `Err` means the access is invalid and the process
/// should be terminated.
pub fn page_fault_handler(
    vm: &Vm,
    fs: &FileSys,
    process: &Arc<Process>,
    fault_addr: usize,
    esp: usize,
) -> Result<Arc<FrameEntry>, ()> {
    if fault_addr == 0 || fault_addr >= PHYS_BASE {
        return Err(());
    }
    let upage = pg_round_down(fault_addr);

    if let Some(entry) = process.spt_lookup(fault_addr) {
        let mut info = entry.state.lock();
        match info.loc {
            PageLoc::Resident { .. } => {
                // The mapping exists; re-faulting on it is a logic error.
                panic!("spurious fault on resident page {:#x}", upage);
            }
            PageLoc::Swapped { slot } => {
                trace!("vm: fault {:#x} <- swap slot {}", upage, slot);
                let fte = vm.frame_alloc(fs, process, AllocFlags::USER);
                vm.swap().swap_in(fte.frame(), slot);
                debug_assert!(process.pagedir().translate(upage).is_none());
                assert!(
                    process.pagedir().map(upage, fte.frame(), info.writable),
                    "page table exhausted"
                );
                info.loc = PageLoc::Resident { frame: fte.frame() };
                fte.set_aux(Arc::clone(&entry));
                Ok(fte)
            }
            PageLoc::Lazy => {
                let mmap = info.mmap.clone().expect("lazy page without backing");
                trace!("vm: fault {:#x} <- mmap offset {}", upage, mmap.offset);
                let fte = vm.frame_alloc(fs, process, AllocFlags::USER);
                let bytes = unsafe { frame_bytes(fte.frame()) };
                let read = mmap.file.read_at(fs, &mut bytes[..mmap.read_bytes], mmap.offset);
                bytes[read..].fill(0);
                debug_assert!(process.pagedir().translate(upage).is_none());
                assert!(
                    process.pagedir().map(upage, fte.frame(), true),
                    "page table exhausted"
                );
                info.loc = PageLoc::Resident { frame: fte.frame() };
                fte.set_aux(Arc::clone(&entry));
                Ok(fte)
            }
        }
    } else if let Some(exec) = process.exec_page_lookup(fault_addr) {
        trace!("vm: fault {:#x} <- executable offset {}", upage, exec.offset);
        let file = process.exec_file().ok_or(())?;
        let fte = vm.frame_alloc(fs, process, AllocFlags::USER);
        let bytes = unsafe { frame_bytes(fte.frame()) };
        let read = file.read_at(fs, &mut bytes[..exec.read_bytes], exec.offset);
        bytes[read..].fill(0);
        install_page(process, &fte, upage, exec.writable);
        Ok(fte)
    } else if is_stack_growth(fault_addr, esp) {
        trace!("vm: fault {:#x} <- stack growth", upage);
        let fte = vm.frame_alloc(fs, process, AllocFlags::USER | AllocFlags::ZERO);
        unsafe { frame_bytes(fte.frame()) }.fill(0);
        install_page(process, &fte, upage, true);
        Ok(fte)
    } else {
        Err(())
    }
}

/// Faults in and pins every frame backing the user range `[addr,
/// addr + len)`, so kernel file I/O into it cannot race eviction.
/// Unpin with [`unpin_all`]. On failure nothing stays pinned.
pub fn pin_user_range(
    vm: &Vm,
    fs: &FileSys,
    process: &Arc<Process>,
    addr: usize,
    len: usize,
    esp: usize,
) -> Result<Vec<Arc<FrameEntry>>, ()> {
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut pinned = Vec::new();
    let first = pg_round_down(addr);
    let last = pg_round_up(addr + len);
    for upage in (first..last).step_by(PGSIZE) {
        let fte = loop {
            match process.pagedir().translate(upage) {
                Some(frame) => {
                    if let Some(fte) = vm.frames().pin(frame) {
                        // The frame may have been evicted and recycled
                        // between the translation and the pin.
                        if process.pagedir().translate(upage) == Some(fte.frame()) {
                            break fte;
                        }
                        fte.unpin();
                    }
                }
                None => match page_fault_handler(vm, fs, process, upage, esp) {
                    Ok(fte) => break fte,
                    Err(()) => {
                        unpin_all(&pinned);
                        return Err(());
                    }
                },
            }
        };
        debug_assert!(Arc::ptr_eq(fte.owner(), process));
        pinned.push(fte);
    }
    Ok(pinned)
}

/// Releases the pins taken by [`pin_user_range`].
pub fn unpin_all(frames: &[Arc<FrameEntry>]) {
    for fte in frames {
        fte.unpin();
    }
}
