//! The per-process state the storage and paging core needs.
//!
//! The scheduler, address-space setup, and descriptor tables live in the
//! embedding kernel; this type carries only what the paging side
//! consumes: the hardware page table handle, the supplemental and
//! executable page tables, the executable image file, and the live mmap
//! regions.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::file::File;
use crate::hal::UserPageTable;
use crate::vm::page::{ExecPage, SptEntry};
use crate::vm::pg_round_down;

/// One live memory mapping.
pub struct MmapRegion {
    pub(crate) mapid: i32,
    /// The private reopen of the mapped file.
    pub(crate) file: Arc<File>,
    pub(crate) addr: usize,
    pub(crate) length: usize,
}

pub struct Process {
    pagedir: Arc<dyn UserPageTable>,
    spt: Mutex<HashMap<usize, Arc<SptEntry>>>,
    exec_pages: Mutex<HashMap<usize, ExecPage>>,
    exec_file: Mutex<Option<Arc<File>>>,
    mmaps: Mutex<Vec<MmapRegion>>,
    next_mapid: AtomicI32,
}

impl Process {
    pub fn new(pagedir: Arc<dyn UserPageTable>) -> Arc<Self> {
        Arc::new(Self {
            pagedir,
            spt: Mutex::new(HashMap::new()),
            exec_pages: Mutex::new(HashMap::new()),
            exec_file: Mutex::new(None),
            mmaps: Mutex::new(Vec::new()),
            next_mapid: AtomicI32::new(1),
        })
    }

    pub fn pagedir(&self) -> &Arc<dyn UserPageTable> {
        &self.pagedir
    }

    /// Records a fresh resident page. The page must not already be
    /// tracked.
    pub fn spt_insert(&self, upage: usize, frame: usize, writable: bool) -> Arc<SptEntry> {
        let entry = Arc::new(SptEntry::new_resident(upage, frame, writable));
        self.spt_insert_entry(Arc::clone(&entry));
        entry
    }

    pub(crate) fn spt_insert_entry(&self, entry: Arc<SptEntry>) {
        let prev = self.spt.lock().insert(entry.page(), entry);
        debug_assert!(prev.is_none(), "page tracked twice");
    }

    /// Finds the entry covering `va`, which need not be page-aligned.
    pub fn spt_lookup(&self, va: usize) -> Option<Arc<SptEntry>> {
        self.spt.lock().get(&pg_round_down(va)).cloned()
    }

    pub fn spt_remove(&self, entry: &Arc<SptEntry>) {
        self.spt.lock().remove(&entry.page());
    }

    pub(crate) fn spt_drain(&self) -> Vec<Arc<SptEntry>> {
        self.spt.lock().drain().map(|(_, entry)| entry).collect()
    }

    /// Registers the lazy-load descriptor for one executable page.
    /// Called at load time; descriptors are immutable afterwards.
    pub fn register_exec_page(&self, upage: usize, page: ExecPage) {
        let prev = self.exec_pages.lock().insert(upage, page);
        debug_assert!(prev.is_none(), "executable page registered twice");
    }

    pub fn exec_page_lookup(&self, va: usize) -> Option<ExecPage> {
        self.exec_pages.lock().get(&pg_round_down(va)).copied()
    }

    pub(crate) fn clear_exec_pages(&self) {
        self.exec_pages.lock().clear();
    }

    /// Installs the executable image the lazy loader reads from. The
    /// loader typically also write-protects it via [`File::deny_write`].
    pub fn set_exec_file(&self, file: File) {
        *self.exec_file.lock() = Some(Arc::new(file));
    }

    pub fn exec_file(&self) -> Option<Arc<File>> {
        self.exec_file.lock().clone()
    }

    pub(crate) fn take_exec_file(&self) -> Option<Arc<File>> {
        self.exec_file.lock().take()
    }

    pub(crate) fn add_mmap(&self, file: Arc<File>, addr: usize, length: usize) -> i32 {
        let mapid = self.next_mapid.fetch_add(1, Ordering::Relaxed);
        self.mmaps.lock().push(MmapRegion {
            mapid,
            file,
            addr,
            length,
        });
        mapid
    }

    pub(crate) fn take_mmap(&self, mapid: i32) -> Option<MmapRegion> {
        let mut mmaps = self.mmaps.lock();
        let idx = mmaps.iter().position(|r| r.mapid == mapid)?;
        Some(mmaps.swap_remove(idx))
    }

    pub(crate) fn take_all_mmaps(&self) -> Vec<MmapRegion> {
        core::mem::take(&mut *self.mmaps.lock())
    }
}
