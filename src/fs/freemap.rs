//! Free sector map.
//!
//! One bit per sector of the filesystem device. The map itself lives in a
//! reserved inode (sector 0, which doubles as the "unallocated" sentinel:
//! data pointers never name it), loaded at mount and written back at
//! unmount.

use alloc::sync::Arc;
use alloc::vec;

use log::debug;
use spin::Mutex;

use crate::bitmap::Bitmap;
use crate::fs::inode::Inode;
use crate::fs::FileSys;

struct FreeMapInner {
    map: Bitmap,
    /// The open free-map file inode, once the volume is mounted.
    file: Option<Arc<Inode>>,
}

pub struct FreeMap {
    inner: Mutex<FreeMapInner>,
}

impl FreeMap {
    pub(crate) fn new(sectors: u32) -> Self {
        Self {
            inner: Mutex::new(FreeMapInner {
                map: Bitmap::new(sectors as usize),
                file: None,
            }),
        }
    }

    /// Claims one free sector.
    pub fn allocate(&self) -> Option<u32> {
        self.inner
            .lock()
            .map
            .scan_and_flip(0, 1, false)
            .map(|idx| idx as u32)
    }

    /// Returns `sector` to the pool.
    pub fn release(&self, sector: u32) {
        let mut inner = self.inner.lock();
        assert!(inner.map.test(sector as usize), "releasing free sector");
        inner.map.set(sector as usize, false);
    }

    /// Marks `sector` in use without allocating it; format-time only.
    pub(crate) fn mark_used(&self, sector: u32) {
        self.inner.lock().map.set(sector as usize, true);
    }

    pub fn count_used(&self) -> usize {
        self.inner.lock().map.count(true)
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.inner.lock().map.byte_len()
    }

    /// Adopts the open free-map file. Its previous handle, if any, is the
    /// caller's to close.
    pub(crate) fn attach(&self, file: Arc<Inode>) {
        self.inner.lock().file = Some(file);
    }

    pub(crate) fn detach(&self) -> Option<Arc<Inode>> {
        self.inner.lock().file.take()
    }

    /// Reads the on-disk map into memory. Mount-time.
    pub(crate) fn load(&self, fs: &FileSys) {
        let (file, len) = {
            let inner = self.inner.lock();
            let file = Arc::clone(inner.file.as_ref().expect("free map not attached"));
            (file, inner.map.byte_len())
        };
        let mut bytes = vec![0u8; len];
        let read = file.read_at(fs, &mut bytes, 0);
        assert_eq!(read, len, "free map file too short");
        self.inner.lock().map.read_bytes(&bytes);
        debug!("fs: free map loaded, {} sectors in use", self.count_used());
    }

    /// Writes the in-memory map back to its file. Unmount-time.
    pub(crate) fn flush(&self, fs: &FileSys) {
        let (file, bytes) = {
            let inner = self.inner.lock();
            let file = Arc::clone(inner.file.as_ref().expect("free map not attached"));
            let mut bytes = vec![0u8; inner.map.byte_len()];
            inner.map.write_bytes(&mut bytes);
            (file, bytes)
        };
        let written = file.write_at(fs, &bytes, 0);
        assert_eq!(written, bytes.len(), "free map file too short");
    }
}
