//! File system geometry. Everything on disk is derived from these.

/// Size of one disk block in bytes.
pub const BLKSIZE: usize = 1024;

/// Block holding the superblock. Block 0 is reserved for a boot area.
pub const SUPERBLOCK_BLK: u32 = 1;

/// First block of the free bitmap.
pub const FREEMAP_BLK: u32 = 2;

/// Bitmap bits per block.
pub const BPB: u32 = (BLKSIZE * 8) as u32;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 10;

/// Block pointers per indirect block.
pub const NINDIRECT: usize = BLKSIZE / core::mem::size_of::<u32>();

/// Largest number of blocks a single file can span.
pub const MAXFILEBLKS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Largest file size in bytes.
pub const MAXFILESIZE: u32 = (MAXFILEBLKS * BLKSIZE) as u32;

/// Size of one on-disk inode record.
pub const INODESIZE: usize = 64;

/// Inodes per block.
pub const IPB: usize = BLKSIZE / INODESIZE;

/// Longest file name, not counting the NUL terminator.
pub const MAXNAMELEN: usize = 117;

/// Size of one on-disk directory entry.
pub const DIRENT_SIZE: usize = 128;

/// Longest symlink target; it lives inline in the inode record.
pub const MAXSYMLINKLEN: usize = 47;

/// Root directory inode number. Inode 0 is reserved and never used.
pub const ROOTINO: u32 = 1;

/// Superblock magic, "MFS1" read as a little-endian u32.
pub const FSMAGIC: u32 = 0x3153_464d;
