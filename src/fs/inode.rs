//! Inodes.
//!
//! An inode describes one file or directory: its length, its directory
//! flag, and the tree of block pointers that locates its data. The
//! on-disk form occupies exactly one sector. Ten direct pointers cover
//! small files; an indirect block and a doubly-indirect block extend the
//! reach to 16,522 data sectors. A pointer value of zero means "no block
//! here": readers of such a hole see zeros, and extension fills it in.
//!
//! The kernel keeps one in-memory inode per on-disk sector, shared by all
//! openers and tracked on the open list ([`Itable`]). The in-memory
//! `length`, `isdir`, and directory entry count are authoritative between
//! open and last close, at which point they are written back — or, if the
//! inode was removed, its blocks are returned to the free map instead.
//!
//! Extension is serialized by a per-inode lock: a writer that grows the
//! file takes it, re-checks the length, and only then allocates and links
//! new blocks. Readers of regular files take the same lock around each
//! chunk so they see either the old length (short read) or fully linked
//! new data, never a half-linked block. Directory inodes skip the lock;
//! the directory layer above serializes them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use log::debug;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::zero_sector;
use crate::fs::FileSys;
use crate::param::{
    BLOCK_SECTOR_SIZE, INODE_MAGIC, MAX_FILE_SIZE, MAX_SECTORS, NDIRECT, NDOUBLE, NINDIRECT,
    PTRS_PER_SECTOR,
};

/// On-disk inode. Exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    /// File size in bytes.
    length: i32,
    direct: [u32; NDIRECT],
    indirect: [u32; NINDIRECT],
    double_indirect: [u32; NDOUBLE],
    /// Non-zero for directories.
    isdir: u8,
    pad: [u8; 3],
    /// Live entries, when a directory.
    entry_cnt: i32,
    magic: u32,
    unused: [u32; 112],
}

const_assert_eq!(mem::size_of::<Dinode>(), BLOCK_SECTOR_SIZE);

impl Dinode {
    fn zeroed() -> Self {
        Self {
            length: 0,
            direct: [0; NDIRECT],
            indirect: [0; NINDIRECT],
            double_indirect: [0; NDOUBLE],
            isdir: 0,
            pad: [0; 3],
            entry_cnt: 0,
            magic: 0,
            unused: [0; 112],
        }
    }
}

/// An index block: 128 sector numbers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct IndirectBlock {
    ptrs: [u32; PTRS_PER_SECTOR],
}

const_assert_eq!(mem::size_of::<IndirectBlock>(), BLOCK_SECTOR_SIZE);

impl IndirectBlock {
    fn zeroed() -> Self {
        Self {
            ptrs: [0; PTRS_PER_SECTOR],
        }
    }
}

/// Walks the pointer tree of one inode, owning the scratch buffers for
/// the two index-block levels it may traverse.
struct BlockWalker {
    level1: IndirectBlock,
    level2: IndirectBlock,
}

impl BlockWalker {
    fn new() -> Self {
        Self {
            level1: IndirectBlock::zeroed(),
            level2: IndirectBlock::zeroed(),
        }
    }

    /// Resolves logical block `idx` of `di` to a sector number, or 0 for
    /// a hole. With `create`, missing blocks along the path are allocated,
    /// zeroed, and linked (index blocks are persisted through the cache
    /// before the data sector is returned); 0 then means the free map is
    /// exhausted. The caller persists `di` itself.
    fn map_block(&mut self, fs: &FileSys, di: &mut Dinode, idx: usize, create: bool) -> u32 {
        let cache = fs.cache();
        if idx < NDIRECT {
            let sector = di.direct[idx];
            if sector == 0 && create {
                let sector = match fs.freemap().allocate() {
                    Some(s) => s,
                    None => return 0,
                };
                di.direct[idx] = sector;
                cache.write_at(sector, zero_sector(), 0);
                return sector;
            }
            sector
        } else if idx < NDIRECT + PTRS_PER_SECTOR {
            if di.indirect[0] == 0 {
                if !create {
                    return 0;
                }
                let sector = match fs.freemap().allocate() {
                    Some(s) => s,
                    None => return 0,
                };
                di.indirect[0] = sector;
                cache.write_at(sector, zero_sector(), 0);
            }
            cache.read_at(di.indirect[0], self.level1.as_bytes_mut(), 0);
            let slot = idx - NDIRECT;
            let sector = self.level1.ptrs[slot];
            if sector == 0 && create {
                let sector = match fs.freemap().allocate() {
                    Some(s) => s,
                    None => return 0,
                };
                self.level1.ptrs[slot] = sector;
                cache.write_at(di.indirect[0], self.level1.as_bytes(), 0);
                cache.write_at(sector, zero_sector(), 0);
                return sector;
            }
            sector
        } else if idx < MAX_SECTORS {
            if di.double_indirect[0] == 0 {
                if !create {
                    return 0;
                }
                let sector = match fs.freemap().allocate() {
                    Some(s) => s,
                    None => return 0,
                };
                di.double_indirect[0] = sector;
                cache.write_at(sector, zero_sector(), 0);
            }

            let rel = idx - (NDIRECT + PTRS_PER_SECTOR);
            let outer = rel / PTRS_PER_SECTOR;
            let inner = rel % PTRS_PER_SECTOR;

            cache.read_at(di.double_indirect[0], self.level1.as_bytes_mut(), 0);
            if self.level1.ptrs[outer] == 0 {
                if !create {
                    return 0;
                }
                let sector = match fs.freemap().allocate() {
                    Some(s) => s,
                    None => return 0,
                };
                self.level1.ptrs[outer] = sector;
                cache.write_at(sector, zero_sector(), 0);
                cache.write_at(di.double_indirect[0], self.level1.as_bytes(), 0);
            }

            cache.read_at(self.level1.ptrs[outer], self.level2.as_bytes_mut(), 0);
            let sector = self.level2.ptrs[inner];
            if sector == 0 && create {
                let sector = match fs.freemap().allocate() {
                    Some(s) => s,
                    None => return 0,
                };
                self.level2.ptrs[inner] = sector;
                cache.write_at(self.level1.ptrs[outer], self.level2.as_bytes(), 0);
                cache.write_at(di.double_indirect[0], self.level1.as_bytes(), 0);
                cache.write_at(sector, zero_sector(), 0);
                return sector;
            }
            sector
        } else {
            panic!("map_block: block index {} out of range", idx);
        }
    }
}

fn bytes_to_sectors(len: usize) -> usize {
    (len + BLOCK_SECTOR_SIZE - 1) / BLOCK_SECTOR_SIZE
}

struct InodeInner {
    open_cnt: u32,
    /// Blocks are freed on last close once set.
    removed: bool,
    /// 0: writes ok, >0: deny writes.
    deny_write_cnt: u32,
    length: i32,
    isdir: bool,
    entry_cnt: i32,
}

/// In-memory inode; one per open on-disk inode, shared by all openers.
pub struct Inode {
    /// Sector of the on-disk inode; the identity.
    sector: u32,
    inner: Mutex<InodeInner>,
    /// Serializes file extension, and chunk access on regular files.
    ext: Mutex<()>,
}

/// Extension lock for regular files; directories are serialized upstream.
fn ext_guard(isdir: bool, ext: &Mutex<()>) -> Option<MutexGuard<'_, ()>> {
    if isdir {
        None
    } else {
        Some(ext.lock())
    }
}

impl Inode {
    fn from_disk(sector: u32, di: &Dinode) -> Self {
        Self {
            sector,
            inner: Mutex::new(InodeInner {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
                length: di.length,
                isdir: di.isdir != 0,
                entry_cnt: di.entry_cnt,
            }),
            ext: Mutex::new(()),
        }
    }

    /// Initializes a fresh on-disk inode at `sector` with `length` bytes
    /// of zeroed, fully allocated data. Returns false if the free map
    /// runs out along the way.
    pub fn create(fs: &FileSys, sector: u32, length: usize, isdir: bool) -> bool {
        assert!(length <= MAX_FILE_SIZE);

        let mut di = Dinode::zeroed();
        di.length = length as i32;
        di.isdir = isdir as u8;
        di.magic = INODE_MAGIC;

        let mut walker = BlockWalker::new();
        for idx in 0..bytes_to_sectors(length) {
            let data = walker.map_block(fs, &mut di, idx, true);
            if data == 0 {
                return false;
            }
            // Fresh files read as zeros without relying on disk hygiene.
            fs.cache().write_at(data, zero_sector(), 0);
        }

        fs.cache().write_at(sector, di.as_bytes(), 0);
        true
    }

    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> usize {
        self.inner.lock().length.max(0) as usize
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().isdir
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    pub fn open_cnt(&self) -> u32 {
        self.inner.lock().open_cnt
    }

    /// Marks the inode for deletion at last close.
    pub fn mark_removed(&self) {
        self.inner.lock().removed = true;
    }

    /// Adds an opener to an already-open inode.
    pub fn reopen(&self) {
        self.inner.lock().open_cnt += 1;
    }

    pub fn entry_cnt(&self) -> i32 {
        self.inner.lock().entry_cnt
    }

    pub fn entry_cnt_inc(&self) {
        self.inner.lock().entry_cnt += 1;
    }

    pub fn entry_cnt_dec(&self) {
        self.inner.lock().entry_cnt -= 1;
    }

    pub fn is_empty_dir(&self) -> bool {
        self.entry_cnt() == 0
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        inner.deny_write_cnt += 1;
        assert!(inner.deny_write_cnt <= inner.open_cnt);
    }

    /// Re-enables writes; pairs with [`Inode::deny_write`].
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.deny_write_cnt > 0);
        assert!(inner.deny_write_cnt <= inner.open_cnt);
        inner.deny_write_cnt -= 1;
    }

    /// Resolves logical block `idx` against the on-disk pointer tree,
    /// persisting any tree changes when `create` holds.
    fn block_to_sector(&self, fs: &FileSys, walker: &mut BlockWalker, idx: usize, create: bool) -> u32 {
        let mut di = Dinode::zeroed();
        fs.cache().read_at(self.sector, di.as_bytes_mut(), 0);
        let sector = walker.map_block(fs, &mut di, idx, create);
        if create {
            fs.cache().write_at(self.sector, di.as_bytes(), 0);
        }
        sector
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`. Returns
    /// the number read, short at end of file or at an unreadable hole.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: usize) -> usize {
        let isdir = self.is_dir();
        let mut walker = BlockWalker::new();
        let mut offset = offset;
        let mut size = buf.len();
        let mut read = 0;

        while size > 0 {
            let block_idx = offset / BLOCK_SECTOR_SIZE;
            let sector_ofs = offset % BLOCK_SECTOR_SIZE;

            let _ext = ext_guard(isdir, &self.ext);
            let inode_left = self.length() as i64 - offset as i64;
            let sector_left = (BLOCK_SECTOR_SIZE - sector_ofs) as i64;
            let chunk = (size as i64).min(inode_left).min(sector_left);
            if chunk <= 0 {
                break;
            }
            let chunk = chunk as usize;

            let sector = self.block_to_sector(fs, &mut walker, block_idx, false);
            if sector == 0 {
                // Hole inside the file: reads as zeros.
                buf[read..read + chunk].fill(0);
            } else {
                fs.cache()
                    .read_at(sector, &mut buf[read..read + chunk], sector_ofs);
            }

            size -= chunk;
            offset += chunk;
            read += chunk;
        }
        read
    }

    /// Writes `buf` starting at byte `offset`, extending the file as
    /// needed. Returns the number written: short when the free map runs
    /// out, 0 while writes are denied.
    pub fn write_at(&self, fs: &FileSys, buf: &[u8], offset: usize) -> usize {
        if self.inner.lock().deny_write_cnt > 0 {
            return 0;
        }
        if offset >= MAX_FILE_SIZE {
            return 0;
        }
        let buf = &buf[..buf.len().min(MAX_FILE_SIZE - offset)];

        let isdir = self.is_dir();
        let mut walker = BlockWalker::new();
        let mut offset = offset;
        let mut size = buf.len();
        let mut written = 0;

        while size > 0 {
            let block_idx = offset / BLOCK_SECTOR_SIZE;
            let sector_ofs = offset % BLOCK_SECTOR_SIZE;
            let sector_left = BLOCK_SECTOR_SIZE - sector_ofs;
            let chunk = size.min(sector_left);

            let _ext = ext_guard(isdir, &self.ext);
            // Writers allocate on demand: both extension and writes into
            // a hole left by an earlier sparse extension get a fresh,
            // zeroed block linked in before any byte lands.
            let sector = self.block_to_sector(fs, &mut walker, block_idx, true);
            if sector == 0 {
                break;
            }
            // The length check happens under the lock: a racing writer
            // may have extended past us while we waited for it, and the
            // published length only ever grows.
            if offset + chunk > self.length() {
                self.inner.lock().length = (offset + chunk) as i32;
            }
            fs.cache()
                .write_at(sector, &buf[written..written + chunk], sector_ofs);
            drop(_ext);

            size -= chunk;
            offset += chunk;
            written += chunk;
        }
        written
    }

    /// Writes the in-memory metadata back to the on-disk inode.
    fn write_back(&self, fs: &FileSys) {
        let mut di = Dinode::zeroed();
        {
            let _ext = self.ext.lock();
            fs.cache().read_at(self.sector, di.as_bytes_mut(), 0);
        }
        {
            let inner = self.inner.lock();
            di.length = inner.length;
            di.entry_cnt = inner.entry_cnt;
            di.isdir = inner.isdir as u8;
        }
        fs.cache().write_at(self.sector, di.as_bytes(), 0);
    }

    /// Returns every block of a removed inode to the free map: the data
    /// sectors (scrubbed from the cache so reuse starts clean), then the
    /// index blocks, then the inode sector itself.
    fn free_blocks(&self, fs: &FileSys) {
        let mut walker = BlockWalker::new();
        for idx in 0..bytes_to_sectors(self.length()) {
            let sector = {
                let _ext = self.ext.lock();
                self.block_to_sector(fs, &mut walker, idx, false)
            };
            if sector != 0 {
                fs.cache().remove(sector);
                fs.freemap().release(sector);
            }
        }

        let mut di = Dinode::zeroed();
        {
            let _ext = self.ext.lock();
            fs.cache().read_at(self.sector, di.as_bytes_mut(), 0);
        }

        if di.indirect[0] != 0 {
            fs.cache().remove(di.indirect[0]);
            fs.freemap().release(di.indirect[0]);
        }

        if di.double_indirect[0] != 0 {
            let mut outer = IndirectBlock::zeroed();
            fs.cache()
                .read_at(di.double_indirect[0], outer.as_bytes_mut(), 0);
            for &inner in outer.ptrs.iter() {
                if inner != 0 {
                    fs.cache().remove(inner);
                    fs.freemap().release(inner);
                }
            }
            fs.cache().remove(di.double_indirect[0]);
            fs.freemap().release(di.double_indirect[0]);
        }

        fs.cache().remove(self.sector);
        fs.freemap().release(self.sector);
        debug!("fs: freed removed inode {}", self.sector);
    }
}

/// The open-inodes list: at most one in-memory inode exists per sector,
/// and every opener shares it. Guarded by its own lock, the innermost of
/// the filesystem locks; it is never held across cache I/O.
pub struct Itable {
    list: Mutex<Vec<Arc<Inode>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Opens the inode stored at `sector`, sharing an existing in-memory
    /// inode when one exists. Returns `None` for an inode already marked
    /// removed; new callers may not open those.
    pub fn open(&self, fs: &FileSys, sector: u32) -> Option<Arc<Inode>> {
        {
            let list = self.list.lock();
            if let Some(inode) = list.iter().find(|i| i.sector == sector) {
                return Self::share(inode);
            }
        }

        // Load from disk without the list lock, then re-check: a racing
        // opener may have beaten us to the insertion.
        let mut di = Dinode::zeroed();
        fs.cache().read_at(sector, di.as_bytes_mut(), 0);
        debug_assert_eq!(di.magic, INODE_MAGIC, "inode {}: bad magic", sector);
        let fresh = Arc::new(Inode::from_disk(sector, &di));

        let mut list = self.list.lock();
        if let Some(inode) = list.iter().find(|i| i.sector == sector) {
            return Self::share(inode);
        }
        list.push(Arc::clone(&fresh));
        Some(fresh)
    }

    fn share(inode: &Arc<Inode>) -> Option<Arc<Inode>> {
        let mut inner = inode.inner.lock();
        if inner.removed {
            return None;
        }
        inner.open_cnt += 1;
        drop(inner);
        Some(Arc::clone(inode))
    }

    /// Drops one opener. The last close writes the metadata back, or
    /// frees every block if the inode was removed.
    pub fn close(&self, fs: &FileSys, inode: Arc<Inode>) {
        let mut list = self.list.lock();
        let last = {
            let mut inner = inode.inner.lock();
            inner.open_cnt -= 1;
            inner.open_cnt == 0
        };
        if !last {
            return;
        }
        list.retain(|i| !Arc::ptr_eq(i, &inode));
        drop(list);

        if inode.is_removed() {
            inode.free_blocks(fs);
        } else {
            inode.write_back(fs);
        }
    }

    /// Writes back the metadata of every open inode. Part of shutdown.
    pub fn flush_all(&self, fs: &FileSys) {
        let open: Vec<Arc<Inode>> = self.list.lock().iter().cloned().collect();
        for inode in open {
            inode.write_back(fs);
        }
    }
}
