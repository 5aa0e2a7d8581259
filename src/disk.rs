//! The block device: a contiguous byte image addressed in whole blocks.
//! Every other layer reaches storage exclusively through this one.

use alloc::boxed::Box;
use alloc::vec;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::LayoutVerified;

use crate::error::{Error, Result};
use crate::param::BLKSIZE;

/// Little-endian u32 as it appears on disk. The image is an arbitrary heap
/// allocation, so every on-disk view must tolerate any alignment.
pub(crate) type Le32 = U32<LittleEndian>;

#[derive(Debug)]
pub struct Disk {
    data: Box<[u8]>,
}

impl Disk {
    /// A zeroed image of `nblocks` blocks.
    pub fn new(nblocks: u32) -> Disk {
        Disk {
            data: vec![0; nblocks as usize * BLKSIZE].into_boxed_slice(),
        }
    }

    /// Wrap an existing image. The length must be a nonzero multiple of
    /// the block size.
    pub fn from_image(data: Box<[u8]>) -> Result<Disk> {
        if data.is_empty() || data.len() % BLKSIZE != 0 {
            return Err(Error::Invalid);
        }
        Ok(Disk { data })
    }

    pub fn into_image(self) -> Box<[u8]> {
        self.data
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }

    pub fn nblocks(&self) -> u32 {
        (self.data.len() / BLKSIZE) as u32
    }

    pub(crate) fn block(&self, bno: u32) -> &[u8] {
        let start = bno as usize * BLKSIZE;
        assert!(start + BLKSIZE <= self.data.len(), "block {} out of range", bno);
        &self.data[start..start + BLKSIZE]
    }

    pub(crate) fn block_mut(&mut self, bno: u32) -> &mut [u8] {
        let start = bno as usize * BLKSIZE;
        assert!(start + BLKSIZE <= self.data.len(), "block {} out of range", bno);
        &mut self.data[start..start + BLKSIZE]
    }

    pub(crate) fn zero_block(&mut self, bno: u32) {
        self.block_mut(bno).fill(0);
    }

    /// View a block as an array of little-endian block numbers, the form
    /// indirect blocks take.
    pub(crate) fn table(&self, bno: u32) -> LayoutVerified<&[u8], [Le32]> {
        LayoutVerified::new_slice_unaligned(self.block(bno)).expect("block size is a multiple of 4")
    }

    pub(crate) fn table_mut(&mut self, bno: u32) -> LayoutVerified<&mut [u8], [Le32]> {
        LayoutVerified::new_slice_unaligned(self.block_mut(bno))
            .expect("block size is a multiple of 4")
    }
}
