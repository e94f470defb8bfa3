use core::mem;

/// Size of a block device sector in bytes.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Size of the disk block cache, in slots.
pub const NBUF: usize = 64;

/// Size of a virtual memory page in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors per page; the unit of swap slot allocation.
pub const SECTORS_PER_PAGE: usize = PGSIZE / BLOCK_SECTOR_SIZE;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 10;

/// Indirect block pointers per inode.
pub const NINDIRECT: usize = 1;

/// Doubly-indirect block pointers per inode.
pub const NDOUBLE: usize = 1;

/// Sector numbers held by one index block.
pub const PTRS_PER_SECTOR: usize = BLOCK_SECTOR_SIZE / mem::size_of::<u32>();

/// Maximum data sectors addressable by one inode.
pub const MAX_SECTORS: usize = NDIRECT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Maximum file size in bytes.
pub const MAX_FILE_SIZE: usize = MAX_SECTORS * BLOCK_SECTOR_SIZE;

/// Identifies a valid on-disk inode.
pub const INODE_MAGIC: u32 = 0x494e4f44;

/// Maximum length of a directory entry name.
pub const NAME_MAX: usize = 14;

/// First user-inaccessible virtual address; user pages live below it.
pub const PHYS_BASE: usize = 0xc000_0000;

/// Maximum distance below the saved stack pointer that still counts as
/// stack growth.
pub const STACK_SLOP: usize = 32;

/// Maximum size of a user stack.
pub const STACK_MAX: usize = 8 * 1024 * 1024;
