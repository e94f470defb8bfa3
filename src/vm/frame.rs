//! The global frame table.
//!
//! Every user frame in circulation has an entry naming its owning process
//! and the supplemental-page-table entry currently occupying it. Victim
//! selection is a clock over the table: a frame whose page was accessed
//! since the last pass gets a second chance, and a frame whose pin is
//! held is mid-I/O and skipped outright. Holding a frame's pin is what
//! keeps the victim chooser's hands off it while its contents are read
//! or written.
//!
//! The table lock covers membership and the clock hand only; it is never
//! held across device I/O. Pins are [`RawLock`]s because they travel:
//! acquired by the chooser or a pinning syscall, released by whoever
//! finishes the I/O.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use log::debug;
use spin::Mutex;

use crate::hal::FrameAllocator;
use crate::proc::Process;
use crate::sync::{relax, RawLock};
use crate::vm::page::SptEntry;

pub struct FrameEntry {
    /// Physical frame address; the identity.
    frame: usize,
    owner: Arc<Process>,
    /// The page occupying this frame. None only while the frame is being
    /// installed, under its pin.
    aux: Mutex<Option<Arc<SptEntry>>>,
    /// Held while the frame's contents are in flight; excludes eviction.
    pin: RawLock,
}

impl FrameEntry {
    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn owner(&self) -> &Arc<Process> {
        &self.owner
    }

    pub fn aux(&self) -> Option<Arc<SptEntry>> {
        self.aux.lock().clone()
    }

    pub(crate) fn set_aux(&self, entry: Arc<SptEntry>) {
        *self.aux.lock() = Some(entry);
    }

    /// Releases the pin taken by allocation, the victim chooser, or
    /// [`FrameTable::pin`].
    pub fn unpin(&self) {
        self.pin.release();
    }
}

struct FrameTableInner {
    map: HashMap<usize, Arc<FrameEntry>>,
    /// Clock hand: the frame to resume scanning at.
    clock: Option<usize>,
}

pub struct FrameTable {
    palloc: Arc<dyn FrameAllocator>,
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    pub fn new(palloc: Arc<dyn FrameAllocator>) -> Self {
        Self {
            palloc,
            inner: Mutex::new(FrameTableInner {
                map: HashMap::new(),
                clock: None,
            }),
        }
    }

    pub(crate) fn palloc(&self) -> &Arc<dyn FrameAllocator> {
        &self.palloc
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, frame: usize) -> Option<Arc<FrameEntry>> {
        self.inner.lock().map.get(&frame).cloned()
    }

    /// Registers a freshly allocated frame, pinned, with no page yet.
    pub(crate) fn insert_pinned(&self, frame: usize, owner: &Arc<Process>) -> Arc<FrameEntry> {
        let fte = Arc::new(FrameEntry {
            frame,
            owner: Arc::clone(owner),
            aux: Mutex::new(None),
            pin: RawLock::new(),
        });
        fte.pin.acquire();
        let prev = self.inner.lock().map.insert(frame, Arc::clone(&fte));
        debug_assert!(prev.is_none(), "frame registered twice");
        fte
    }

    /// Pins `frame` against eviction, waiting out any holder. Returns
    /// `None` once the frame has left the table.
    pub fn pin(&self, frame: usize) -> Option<Arc<FrameEntry>> {
        loop {
            let fte = self.inner.lock().map.get(&frame).cloned()?;
            if fte.pin.try_acquire() {
                // The holder we raced may have been mid-removal; only a
                // frame still in the table counts as pinned.
                let still_there = self
                    .inner
                    .lock()
                    .map
                    .get(&frame)
                    .map_or(false, |e| Arc::ptr_eq(e, &fte));
                if still_there {
                    return Some(fte);
                }
                fte.pin.release();
                return None;
            }
            relax();
        }
    }

    /// Clock scan for an evictable frame. Returns it with its pin held;
    /// the caller resolves its page and removes it. Loops (with a yield)
    /// until some frame is neither accessed nor pinned.
    pub(crate) fn choose_victim(&self) -> Arc<FrameEntry> {
        loop {
            let mut inner = self.inner.lock();
            let entries: Vec<Arc<FrameEntry>> = inner.map.values().cloned().collect();
            if !entries.is_empty() {
                let start = inner
                    .clock
                    .and_then(|frame| entries.iter().position(|e| e.frame == frame))
                    .unwrap_or(0);
                for idx in start..entries.len() {
                    let fte = &entries[idx];
                    // A frame mid-installation has no page yet and is
                    // pinned anyway.
                    let aux = match fte.aux.lock().clone() {
                        Some(aux) => aux,
                        None => continue,
                    };
                    let upage = aux.page();
                    let pagedir = fte.owner.pagedir();
                    if pagedir.is_accessed(upage) {
                        pagedir.set_accessed(upage, false);
                    } else if fte.pin.try_acquire() {
                        inner.clock = entries.get(idx + 1).map(|e| e.frame);
                        debug!("vm: evicting frame {:#x} (page {:#x})", fte.frame, upage);
                        return Arc::clone(fte);
                    }
                }
                inner.clock = None;
            }
            drop(inner);
            relax();
        }
    }

    /// Unlinks a pinned frame: clears the owner's mapping, removes the
    /// table entry, frees the physical page, and drops the pin.
    pub fn remove(&self, fte: &Arc<FrameEntry>) {
        debug_assert!(fte.pin.is_held());
        let aux = fte.aux.lock().clone();
        let aux = aux.expect("removing a frame that was never installed");
        fte.owner.pagedir().unmap(aux.page());
        self.inner.lock().map.remove(&fte.frame);
        self.palloc.free(fte.frame);
        fte.pin.release();
    }
}
