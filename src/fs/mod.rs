//! Filesystem layers, bottom up:
//!
//! * Free map: allocator for raw disk sectors ([`freemap`]).
//! * Inodes: the block-pointer tree, reading, writing, growth, metadata
//!   ([`inode`]).
//! * Directories: inodes with special contents ([`dir`]).
//!
//! All sector traffic funnels through the buffer cache ([`crate::bio`]).
//! [`FileSys`] ties the layers to one block device and carries them
//! through every call; path resolution and descriptor bookkeeping belong
//! to the layer above.

use alloc::sync::Arc;

use log::info;

use crate::bio::BufCache;
use crate::file::File;
use crate::hal::BlockDevice;

pub mod dir;
pub mod freemap;
pub mod inode;

pub use dir::Dir;
pub use freemap::FreeMap;
pub use inode::{Inode, Itable};

/// Sector of the free-map file inode. Also the hole sentinel: no data
/// pointer ever names sector 0, which is what makes 0 usable as "not
/// allocated".
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

pub struct FileSys {
    cache: BufCache,
    freemap: FreeMap,
    itable: Itable,
}

impl FileSys {
    /// Brings up the filesystem on `dev`. With `format`, writes a fresh
    /// empty volume first; otherwise the on-disk free map is loaded as-is.
    pub fn mount(dev: Arc<dyn BlockDevice>, format: bool) -> Self {
        let sectors = dev.sector_count();
        let fs = Self {
            cache: BufCache::new(dev),
            freemap: FreeMap::new(sectors),
            itable: Itable::new(),
        };

        if format {
            fs.format();
        }

        let map_file = fs
            .open_inode(FREE_MAP_SECTOR)
            .expect("free map inode missing");
        fs.freemap.attach(map_file);
        if format {
            fs.freemap.flush(&fs);
        } else {
            fs.freemap.load(&fs);
        }

        info!(
            "fs: mounted, {} sectors ({} in use)",
            sectors,
            fs.freemap.count_used()
        );
        fs
    }

    /// Lays out an empty volume: the free-map file and an empty root
    /// directory.
    fn format(&self) {
        self.freemap.mark_used(FREE_MAP_SECTOR);
        self.freemap.mark_used(ROOT_DIR_SECTOR);
        assert!(
            Inode::create(self, FREE_MAP_SECTOR, self.freemap.byte_len(), false),
            "format: free map file"
        );
        assert!(
            Dir::create(self, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR),
            "format: root directory"
        );
        info!("fs: formatted");
    }

    /// Flushes everything and stops the cache worker. The final write
    /// order is the free map, then remaining open-inode metadata, then
    /// the dirty cache slots.
    pub fn unmount(&self) {
        self.freemap.flush(self);
        if let Some(map_file) = self.freemap.detach() {
            self.close_inode(map_file);
        }
        self.itable.flush_all(self);
        self.cache.shutdown();
        info!("fs: unmounted");
    }

    pub fn cache(&self) -> &BufCache {
        &self.cache
    }

    pub fn freemap(&self) -> &FreeMap {
        &self.freemap
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    /// Opens the inode stored at `sector`.
    pub fn open_inode(&self, sector: u32) -> Option<Arc<Inode>> {
        self.itable.open(self, sector)
    }

    /// Drops one opener of `inode`.
    pub fn close_inode(&self, inode: Arc<Inode>) {
        self.itable.close(self, inode);
    }

    pub fn open_root(&self) -> Dir {
        Dir::new(self.open_inode(ROOT_DIR_SECTOR).expect("root directory"))
    }

    /// Creates a regular file named `name` under `dir` with `initial_size`
    /// zeroed bytes.
    pub fn create(&self, dir: &Dir, name: &str, initial_size: usize) -> bool {
        if dir.lookup(self, name).is_some() {
            return false;
        }
        let sector = match self.freemap.allocate() {
            Some(sector) => sector,
            None => return false,
        };
        if !Inode::create(self, sector, initial_size, false) {
            self.freemap.release(sector);
            return false;
        }
        if !dir.add(self, name, sector) {
            self.freemap.release(sector);
            return false;
        }
        true
    }

    /// Creates a subdirectory named `name` under `dir`.
    pub fn create_dir(&self, dir: &Dir, name: &str) -> bool {
        if dir.lookup(self, name).is_some() {
            return false;
        }
        let sector = match self.freemap.allocate() {
            Some(sector) => sector,
            None => return false,
        };
        if !Dir::create(self, sector, dir.inode().inumber()) {
            self.freemap.release(sector);
            return false;
        }
        if !dir.add(self, name, sector) {
            self.freemap.release(sector);
            return false;
        }
        true
    }

    /// Opens `name` under `dir` as a file object.
    pub fn open(&self, dir: &Dir, name: &str) -> Option<File> {
        let sector = dir.lookup(self, name)?;
        let inode = self.open_inode(sector)?;
        Some(File::new(inode))
    }

    /// Removes `name` from `dir`; the inode's blocks are freed once the
    /// last opener closes it.
    pub fn remove(&self, dir: &Dir, name: &str) -> bool {
        dir.remove(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::BLOCK_SECTOR_SIZE;
    use crate::test_util::MemDisk;
    use std::sync::Arc;
    use std::thread;
    use std::vec;
    use std::vec::Vec;

    const DISK_SECTORS: u32 = 4096;

    fn fresh_fs() -> (Arc<FileSys>, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(DISK_SECTORS));
        let fs = Arc::new(FileSys::mount(
            disk.clone() as Arc<dyn crate::hal::BlockDevice>,
            true,
        ));
        (fs, disk)
    }

    #[test]
    fn create_write_close_reopen_read() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "f", 600));

        let file = fs.open(&root, "f").unwrap();
        assert_eq!(file.len(), 600);
        assert_eq!(file.write_at(&fs, &[0x41; 600], 0), 600);
        file.close(&fs);

        let file = fs.open(&root, "f").unwrap();
        assert_eq!(file.len(), 600);
        let mut out = vec![0u8; 600];
        assert_eq!(file.read_at(&fs, &mut out, 0), 600);
        assert!(out.iter().all(|&b| b == 0x41));
        // Reading at end of file returns nothing.
        let mut one = [0u8; 1];
        assert_eq!(file.read_at(&fs, &mut one, 600), 0);
        file.close(&fs);
        root.close(&fs);
    }

    #[test]
    fn sparse_write_far_past_eof() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "sparse", 0));

        let file = fs.open(&root, "sparse").unwrap();
        assert_eq!(file.write_at(&fs, b"ABC", 1_000_000), 3);
        assert_eq!(file.len(), 1_000_003);

        let mut out = [0xffu8; 6];
        assert_eq!(file.read_at(&fs, &mut out, 999_997), 6);
        assert_eq!(&out, &[0, 0, 0, b'A', b'B', b'C']);

        // Bytes inside the hole read as zeros.
        let mut hole = [0xffu8; 16];
        assert_eq!(file.read_at(&fs, &mut hole, 123_456), 16);
        assert_eq!(hole, [0; 16]);

        file.close(&fs);
        root.close(&fs);
    }

    #[test]
    fn hole_range_is_zero_after_extension() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "h", 0));
        let file = fs.open(&root, "h").unwrap();

        assert_eq!(file.write_at(&fs, &[7u8; 100], 0), 100);
        assert_eq!(file.write_at(&fs, &[9u8; 50], 10_000), 50);
        assert_eq!(file.len(), 10_050);

        let mut out = vec![0xaau8; 10_050];
        assert_eq!(file.read_at(&fs, &mut out, 0), 10_050);
        assert!(out[..100].iter().all(|&b| b == 7));
        assert!(out[100..10_000].iter().all(|&b| b == 0));
        assert!(out[10_000..].iter().all(|&b| b == 9));

        file.close(&fs);
        root.close(&fs);
    }

    #[test]
    fn deny_write_blocks_all_openers() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "x", 0));

        let a = fs.open(&root, "x").unwrap();
        let b = fs.open(&root, "x").unwrap();
        a.deny_write();
        assert_eq!(b.write_at(&fs, &[1u8; 10], 0), 0);
        assert_eq!(a.write_at(&fs, &[1u8; 10], 0), 0);
        a.allow_write();
        assert_eq!(b.write_at(&fs, &[1u8; 10], 0), 10);

        a.close(&fs);
        b.close(&fs);
        root.close(&fs);
    }

    #[test]
    fn remove_frees_blocks_on_last_close() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "victim", 0));

        let file = fs.open(&root, "victim").unwrap();
        assert_eq!(file.write_at(&fs, &[5u8; 100_000], 0), 100_000);
        let used_full = fs.freemap().count_used();

        assert!(fs.remove(&root, "victim"));
        assert!(fs.open(&root, "victim").is_none());

        // The opener still reads and writes its data.
        let mut out = [0u8; 64];
        assert_eq!(file.read_at(&fs, &mut out, 4096), 64);
        assert_eq!(out, [5u8; 64]);
        assert_eq!(file.write_at(&fs, &[6u8; 8], 0), 8);

        file.close(&fs);
        // 100_000 bytes = 196 data sectors + indirect + double indirect
        // + one inner index block + the inode itself.
        let freed = used_full - fs.freemap().count_used();
        assert_eq!(freed, 196 + 1 + 1 + 1 + 1);
        root.close(&fs);
    }

    #[test]
    fn concurrent_extension_disjoint_offsets() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "grow", 0));
        root.close(&fs);

        let mut handles = Vec::new();
        for t in 0..4usize {
            let fs = Arc::clone(&fs);
            handles.push(thread::spawn(move || {
                let root = fs.open_root();
                let file = fs.open(&root, "grow").unwrap();
                let pattern = [(t + 1) as u8; 1024];
                // Sector-aligned, disjoint stripes per writer.
                let offset = t * 100 * BLOCK_SECTOR_SIZE;
                assert_eq!(file.write_at(&fs, &pattern, offset), 1024);
                file.close(&fs);
                root.close(&fs);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let root = fs.open_root();
        let file = fs.open(&root, "grow").unwrap();
        assert_eq!(file.len(), 3 * 100 * BLOCK_SECTOR_SIZE + 1024);
        for t in 0..4usize {
            let mut out = [0u8; 1024];
            let offset = t * 100 * BLOCK_SECTOR_SIZE;
            assert_eq!(file.read_at(&fs, &mut out, offset), 1024);
            assert_eq!(out, [(t + 1) as u8; 1024], "writer {}", t);
        }
        file.close(&fs);
        root.close(&fs);
    }

    #[test]
    fn directories_add_lookup_remove() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();

        assert!(fs.create_dir(&root, "sub"));
        assert!(fs.create(&root, "a", 10));
        let sub = Dir::new(fs.open_inode(root.lookup(&fs, "sub").unwrap()).unwrap());
        assert!(fs.create(&sub, "inner", 0));

        // Enumeration skips the dot entries.
        assert_eq!(sub.read_entry(&fs).as_deref(), Some("inner"));
        assert!(sub.read_entry(&fs).is_none());

        // A non-empty directory cannot be removed.
        assert!(!fs.remove(&root, "sub"));
        assert!(fs.remove(&sub, "inner"));
        assert!(fs.remove(&root, "sub"));
        assert!(root.lookup(&fs, "sub").is_none());

        // Dot entries resolve but are immortal.
        assert_eq!(root.lookup(&fs, "."), Some(ROOT_DIR_SECTOR));
        assert!(!fs.remove(&root, "."));

        sub.close(&fs);
        root.close(&fs);
    }

    #[test]
    fn duplicate_names_rejected() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "dup", 0));
        assert!(!fs.create(&root, "dup", 0));
        assert!(!fs.create_dir(&root, "dup"));
        root.close(&fs);
    }

    #[test]
    fn unmount_then_remount_preserves_volume() {
        let disk = Arc::new(MemDisk::new(DISK_SECTORS));
        {
            let fs = FileSys::mount(disk.clone() as Arc<dyn crate::hal::BlockDevice>, true);
            let root = fs.open_root();
            assert!(fs.create(&root, "keep", 0));
            let file = fs.open(&root, "keep").unwrap();
            assert_eq!(file.write_at(&fs, b"persistent data", 0), 15);
            file.close(&fs);
            root.close(&fs);
            fs.unmount();
        }

        let fs = FileSys::mount(disk.clone() as Arc<dyn crate::hal::BlockDevice>, false);
        let root = fs.open_root();
        let file = fs.open(&root, "keep").unwrap();
        assert_eq!(file.len(), 15);
        let mut out = [0u8; 15];
        assert_eq!(file.read_at(&fs, &mut out, 0), 15);
        assert_eq!(&out, b"persistent data");

        // The reloaded free map still accounts for the file: creating
        // another must not clobber existing sectors.
        assert!(fs.create(&root, "more", 2048));
        let mut out = [0u8; 15];
        let file2 = fs.open(&root, "more").unwrap();
        assert_eq!(file2.read_at(&fs, &mut out, 0), 15);
        assert_eq!(out, [0u8; 15]);
        let mut out = [0u8; 15];
        assert_eq!(file.read_at(&fs, &mut out, 0), 15);
        assert_eq!(&out, b"persistent data");

        file.close(&fs);
        file2.close(&fs);
        root.close(&fs);
        fs.unmount();
    }

    #[test]
    fn write_past_max_file_size_is_short() {
        let (fs, _disk) = fresh_fs();
        let root = fs.open_root();
        assert!(fs.create(&root, "big", 0));
        let file = fs.open(&root, "big").unwrap();
        assert_eq!(
            file.write_at(&fs, &[1u8; 8], crate::param::MAX_FILE_SIZE),
            0
        );
        file.close(&fs);
        root.close(&fs);
    }
}
