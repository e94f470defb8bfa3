//! Directories.
//!
//! A directory is an inode whose contents are a flat array of fixed-size
//! entries. Every directory carries `.` and `..`; those two are invisible
//! to enumeration and protected from removal, and the inode's entry count
//! tracks only the live entries beyond them. Concurrent access to one
//! directory is serialized by the layers above; this module assumes it.

use alloc::string::String;
use alloc::sync::Arc;
use core::mem;

use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::inode::Inode;
use crate::fs::FileSys;
use crate::param::NAME_MAX;

/// On-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DirEntry {
    inode_sector: u32,
    /// NUL-padded name.
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

pub const DIR_ENTRY_SIZE: usize = mem::size_of::<DirEntry>();
const_assert_eq!(DIR_ENTRY_SIZE, 20);

impl DirEntry {
    fn zeroed() -> Self {
        Self {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn new(name: &str, inode_sector: u32) -> Self {
        let mut entry = Self {
            inode_sector,
            name: [0; NAME_MAX + 1],
            in_use: 1,
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    fn name_matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        bytes.len() <= NAME_MAX
            && &self.name[..bytes.len()] == bytes
            && self.name[bytes.len()] == 0
    }

    fn name(&self) -> String {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX + 1);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}

fn name_ok(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX
}

/// An open directory: an inode handle plus an enumeration position.
pub struct Dir {
    inode: Arc<Inode>,
    pos: Mutex<usize>,
}

impl Dir {
    /// Wraps an open directory inode.
    pub fn new(inode: Arc<Inode>) -> Self {
        assert!(inode.is_dir());
        Self {
            inode,
            pos: Mutex::new(0),
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Closes the backing inode.
    pub fn close(self, fs: &FileSys) {
        fs.close_inode(self.inode);
    }

    /// Creates a fresh directory at `sector` containing `.` and `..`.
    pub(crate) fn create(fs: &FileSys, sector: u32, parent_sector: u32) -> bool {
        if !Inode::create(fs, sector, 0, true) {
            return false;
        }
        let inode = match fs.open_inode(sector) {
            Some(inode) => inode,
            None => return false,
        };
        // The dot entries are structural: written directly, not counted.
        let dot = DirEntry::new(".", sector);
        let dotdot = DirEntry::new("..", parent_sector);
        let ok = inode.write_at(fs, dot.as_bytes(), 0) == DIR_ENTRY_SIZE
            && inode.write_at(fs, dotdot.as_bytes(), DIR_ENTRY_SIZE) == DIR_ENTRY_SIZE;
        fs.close_inode(inode);
        ok
    }

    fn entry_at(&self, fs: &FileSys, ofs: usize) -> Option<DirEntry> {
        let mut entry = DirEntry::zeroed();
        if self.inode.read_at(fs, entry.as_bytes_mut(), ofs) == DIR_ENTRY_SIZE {
            Some(entry)
        } else {
            None
        }
    }

    /// Finds `name`, returning the entry and its byte offset.
    fn find(&self, fs: &FileSys, name: &str) -> Option<(DirEntry, usize)> {
        let mut ofs = 0;
        while let Some(entry) = self.entry_at(fs, ofs) {
            if entry.in_use != 0 && entry.name_matches(name) {
                return Some((entry, ofs));
            }
            ofs += DIR_ENTRY_SIZE;
        }
        None
    }

    /// Returns the inode sector `name` refers to.
    pub fn lookup(&self, fs: &FileSys, name: &str) -> Option<u32> {
        self.find(fs, name).map(|(entry, _)| entry.inode_sector)
    }

    /// Adds an entry for `name`, reusing a vacated slot when one exists.
    /// Fails on a duplicate or unusable name.
    pub fn add(&self, fs: &FileSys, name: &str, inode_sector: u32) -> bool {
        if !name_ok(name) || self.find(fs, name).is_some() {
            return false;
        }

        let mut ofs = 0;
        while let Some(entry) = self.entry_at(fs, ofs) {
            if entry.in_use == 0 {
                break;
            }
            ofs += DIR_ENTRY_SIZE;
        }

        let entry = DirEntry::new(name, inode_sector);
        if self.inode.write_at(fs, entry.as_bytes(), ofs) != DIR_ENTRY_SIZE {
            return false;
        }
        self.inode.entry_cnt_inc();
        true
    }

    /// Removes `name` and marks its inode for deletion at last close.
    /// Non-empty directories and the dot entries stay.
    pub fn remove(&self, fs: &FileSys, name: &str) -> bool {
        if name == "." || name == ".." {
            return false;
        }
        let (mut entry, ofs) = match self.find(fs, name) {
            Some(found) => found,
            None => return false,
        };
        let target = match fs.open_inode(entry.inode_sector) {
            Some(inode) => inode,
            None => return false,
        };
        if target.is_dir() && !target.is_empty_dir() {
            fs.close_inode(target);
            return false;
        }

        entry.in_use = 0;
        if self.inode.write_at(fs, entry.as_bytes(), ofs) != DIR_ENTRY_SIZE {
            fs.close_inode(target);
            return false;
        }
        target.mark_removed();
        self.inode.entry_cnt_dec();
        fs.close_inode(target);
        true
    }

    /// Enumerates the next live entry name, skipping `.` and `..`.
    pub fn read_entry(&self, fs: &FileSys) -> Option<String> {
        let mut pos = self.pos.lock();
        while let Some(entry) = self.entry_at(fs, *pos) {
            *pos += DIR_ENTRY_SIZE;
            if entry.in_use != 0 {
                let name = entry.name();
                if name != "." && name != ".." {
                    return Some(name);
                }
            }
        }
        None
    }
}
