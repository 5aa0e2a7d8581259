use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::disk::{Disk, Le32};
use crate::error::{Error, Result};
use crate::param::{BLKSIZE, BPB, FREEMAP_BLK, FSMAGIC, IPB, SUPERBLOCK_BLK};

/// Disk layout:
/// [ boot block | super block | free bitmap | inode blocks | data blocks ]
///
/// The superblock records the geometry; it is written once when the image
/// is formatted and read-only afterwards.
#[repr(C)]
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
struct RawSuperblock {
    /// Must be FSMAGIC.
    magic: Le32,

    /// Size of the image in blocks.
    nblocks: Le32,

    /// Number of inode-table slots.
    ninodes: Le32,

    /// Block number of the first inode block.
    firstinob: Le32,

    /// Block size the image was built with.
    blksize: Le32,
}

const_assert!(mem::size_of::<RawSuperblock>() <= BLKSIZE);

/// Decoded superblock held in memory while the file system is mounted.
#[derive(Clone, Copy, Debug)]
pub struct Superblock {
    pub nblocks: u32,
    pub ninodes: u32,
    pub firstinob: u32,
}

impl Superblock {
    pub(crate) fn read(disk: &Disk) -> Result<Superblock> {
        let (raw, _) =
            LayoutVerified::<_, RawSuperblock>::new_unaligned_from_prefix(disk.block(SUPERBLOCK_BLK))
                .expect("superblock fits in one block");
        if raw.magic.get() != FSMAGIC || raw.blksize.get() != BLKSIZE as u32 {
            return Err(Error::Invalid);
        }
        let sb = Superblock {
            nblocks: raw.nblocks.get(),
            ninodes: raw.ninodes.get(),
            firstinob: raw.firstinob.get(),
        };
        // Validate in u64: a hostile image must not wrap the sums.
        let inode_span = (sb.ninodes as u64 + IPB as u64 - 1) / IPB as u64;
        if sb.nblocks != disk.nblocks()
            || sb.ninodes == 0
            || sb.firstinob <= FREEMAP_BLK
            || (sb.bitmap_blocks() as u64 * BPB as u64) < sb.nblocks as u64
            || (sb.firstinob as u64 + inode_span) >= sb.nblocks as u64
        {
            return Err(Error::Invalid);
        }
        Ok(sb)
    }

    pub(crate) fn write(&self, disk: &mut Disk) {
        let raw = RawSuperblock {
            magic: Le32::new(FSMAGIC),
            nblocks: Le32::new(self.nblocks),
            ninodes: Le32::new(self.ninodes),
            firstinob: Le32::new(self.firstinob),
            blksize: Le32::new(BLKSIZE as u32),
        };
        disk.block_mut(SUPERBLOCK_BLK)[..mem::size_of::<RawSuperblock>()]
            .copy_from_slice(raw.as_bytes());
    }

    /// Block containing inode `ino`.
    pub(crate) fn iblock(&self, ino: u32) -> u32 {
        self.firstinob + ino / IPB as u32
    }

    /// Byte offset of inode `ino` within its block.
    pub(crate) fn ioffset(ino: u32) -> usize {
        (ino as usize % IPB) * crate::param::INODESIZE
    }

    pub(crate) fn bitmap_blocks(&self) -> u32 {
        self.firstinob - FREEMAP_BLK
    }

    pub(crate) fn inode_blocks(&self) -> u32 {
        (self.ninodes + IPB as u32 - 1) / IPB as u32
    }

    /// First block past the inode table; everything from here on is data.
    pub fn first_data_block(&self) -> u32 {
        self.firstinob + self.inode_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_addressing() {
        let sb = Superblock { nblocks: 256, ninodes: 32, firstinob: 3 };
        assert_eq!(sb.iblock(0), 3);
        assert_eq!(sb.iblock(15), 3);
        assert_eq!(sb.iblock(16), 4);
        assert_eq!(Superblock::ioffset(0), 0);
        assert_eq!(Superblock::ioffset(1), 64);
        assert_eq!(Superblock::ioffset(17), 64);
        assert_eq!(sb.inode_blocks(), 2);
        assert_eq!(sb.first_data_block(), 5);
    }

    #[test]
    fn rejects_bad_geometry() {
        let fs = crate::Fs::format(64, 16).unwrap();
        let mut image = fs.into_image();
        image[BLKSIZE] ^= 0xff; // clobber the magic
        assert_eq!(crate::Fs::open(image).unwrap_err(), Error::Invalid);
    }
}
