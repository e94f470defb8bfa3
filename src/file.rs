//! Open-file objects.
//!
//! A `File` pairs a shared inode with a private seek position. Positions
//! advance on `read`/`write`; the `_at` variants leave them alone (the
//! paging side uses those, since mmap write-back and lazy loads address
//! the file absolutely). Each opener that wants the executable-style
//! write protection toggles it through `deny_write`, which forwards to
//! the inode's counter so every opener observes it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::fs::{FileSys, Inode};

pub struct File {
    inode: Arc<Inode>,
    pos: Mutex<usize>,
    deny_write: AtomicBool,
}

impl File {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            pos: Mutex::new(0),
            deny_write: AtomicBool::new(false),
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn len(&self) -> usize {
        self.inode.length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens another handle on the same inode with an independent seek
    /// position.
    pub fn reopen(&self) -> File {
        self.inode.reopen();
        File::new(Arc::clone(&self.inode))
    }

    /// Reads from the current position, advancing it.
    pub fn read(&self, fs: &FileSys, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.read_at(fs, buf, *pos);
        *pos += n;
        n
    }

    /// Writes at the current position, advancing it.
    pub fn write(&self, fs: &FileSys, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.write_at(fs, buf, *pos);
        *pos += n;
        n
    }

    /// Reads at an absolute offset; the seek position is untouched.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(fs, buf, offset)
    }

    /// Writes at an absolute offset; the seek position is untouched.
    pub fn write_at(&self, fs: &FileSys, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(fs, buf, offset)
    }

    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }

    /// Blocks writes to the backing inode until `allow_write` (or close).
    /// Idempotent per handle.
    pub fn deny_write(&self) {
        if !self.deny_write.swap(true, Ordering::Relaxed) {
            self.inode.deny_write();
        }
    }

    /// Undoes this handle's `deny_write`, if any.
    pub fn allow_write(&self) {
        if self.deny_write.swap(false, Ordering::Relaxed) {
            self.inode.allow_write();
        }
    }

    /// Releases the handle, dropping any write denial it still holds.
    pub fn close(self, fs: &FileSys) {
        if self.deny_write.load(Ordering::Relaxed) {
            self.inode.allow_write();
        }
        fs.close_inode(self.inode);
    }
}
