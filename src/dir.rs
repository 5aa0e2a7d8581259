//! Directories: files whose bytes are a packed array of fixed-size
//! entries. An entry with inode number 0 is a tombstone; unlink leaves
//! tombstones behind and later creates reuse them, so directories never
//! shrink and readdir cursors stay stable. `"."` and `".."` are
//! synthesized on iteration, never stored.

use log::warn;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::disk::{Disk, Le32};
use crate::error::{Error, Result};
use crate::inode::{self, Inode, InodeType};
use crate::param::{BLKSIZE, DIRENT_SIZE, MAXNAMELEN};
use crate::superblock::Superblock;

/// Whether an iteration callback wants to see more entries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IterationDecision {
    Continue,
    Break,
}

const NAME_BYTES: usize = MAXNAMELEN + 1;
const DIRENT_PAD: usize = DIRENT_SIZE - 4 - NAME_BYTES;

/// On-disk directory entry: inode number plus NUL-terminated name.
#[repr(C)]
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
pub(crate) struct Dirent {
    ino: Le32,
    name: [u8; NAME_BYTES],
    _pad: [u8; DIRENT_PAD],
}

const_assert!(core::mem::size_of::<Dirent>() == DIRENT_SIZE);
const_assert!(BLKSIZE % DIRENT_SIZE == 0);

impl Dirent {
    pub(crate) fn empty() -> Dirent {
        Dirent {
            ino: Le32::new(0),
            name: [0; NAME_BYTES],
            _pad: [0; DIRENT_PAD],
        }
    }

    pub(crate) fn ino(&self) -> u32 {
        self.ino.get()
    }

    pub(crate) fn set_ino(&mut self, ino: u32) {
        self.ino.set(ino);
    }

    /// Name bytes up to the terminator.
    pub(crate) fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(MAXNAMELEN);
        &self.name[..len]
    }

    /// Install `name` and its terminator; the caller has checked the
    /// length. Bytes past the terminator are left as they were.
    pub(crate) fn set_name(&mut self, name: &[u8]) {
        debug_assert!(name.len() <= MAXNAMELEN);
        self.name[..name.len()].copy_from_slice(name);
        self.name[name.len()] = 0;
    }
}

pub(crate) fn read_entry(disk: &Disk, dir: &Inode, off: u32) -> Result<Dirent> {
    debug_assert_eq!(off as usize % DIRENT_SIZE, 0);
    let bno = inode::block_of(disk, dir, off)?.ok_or(Error::Io)?;
    let begin = off as usize % BLKSIZE;
    let lv = LayoutVerified::<_, Dirent>::new_unaligned(&disk.block(bno)[begin..begin + DIRENT_SIZE])
        .expect("dirent record size");
    Ok((*lv).clone())
}

pub(crate) fn write_entry(disk: &mut Disk, dir: &Inode, off: u32, de: &Dirent) -> Result<()> {
    debug_assert_eq!(off as usize % DIRENT_SIZE, 0);
    let bno = inode::block_of(disk, dir, off)?.ok_or(Error::Io)?;
    let begin = off as usize % BLKSIZE;
    disk.block_mut(bno)[begin..begin + DIRENT_SIZE].copy_from_slice(de.as_bytes());
    Ok(())
}

/// Scan `dir` for a live entry named `name`; returns its byte offset.
pub(crate) fn find_entry(disk: &Disk, dir: &Inode, name: &[u8]) -> Result<Option<u32>> {
    debug_assert_eq!(dir.typ, InodeType::Dir);
    let mut off = 0;
    while off < dir.size {
        let de = read_entry(disk, dir, off)?;
        if de.ino() != 0 && de.name() == name {
            return Ok(Some(off));
        }
        off += DIRENT_SIZE as u32;
    }
    Ok(None)
}

/// Offset of a free entry slot in `dir`, reusing a tombstone when one
/// exists and otherwise extending the directory by one block of fresh
/// ones.
pub(crate) fn create_blank_entry(disk: &mut Disk, sb: &Superblock, dir_ino: u32) -> Result<u32> {
    let dir = inode::read_inode(disk, sb, dir_ino)?;
    let mut off = 0;
    while off < dir.size {
        if read_entry(disk, &dir, off)?.ino() == 0 {
            return Ok(off);
        }
        off += DIRENT_SIZE as u32;
    }
    inode::add_block(disk, sb, dir_ino)?;
    let dir = inode::read_inode(disk, sb, dir_ino)?;
    if read_entry(disk, &dir, off)?.ino() != 0 {
        warn!("fresh directory block not zeroed");
        return Err(Error::Io);
    }
    Ok(off)
}

/// Stream `dir`'s entries through `emit`, resuming from `*pos`. Position
/// 0 is `"."`, 1 is `".."`, and `k >= 2` addresses byte `k - 2` of the
/// directory data; tombstones are skipped silently. Returns `Ok(true)` at
/// the end of the directory and `Ok(false)` when `emit` broke off, in
/// which case the cursor still points at the refused entry.
pub(crate) fn readdir<F>(
    disk: &Disk,
    sb: &Superblock,
    dir_ino: u32,
    pos: &mut u32,
    mut emit: F,
) -> Result<bool>
where
    F: FnMut(&[u8], u32, InodeType) -> IterationDecision,
{
    let dir = inode::read_inode(disk, sb, dir_ino)?;
    if dir.typ != InodeType::Dir {
        return Err(Error::Invalid);
    }
    if *pos == 0 {
        if emit(b".", dir_ino, InodeType::Dir) == IterationDecision::Break {
            return Ok(false);
        }
        *pos = 1;
    }
    if *pos == 1 {
        // No parent links are kept on disk; ".." names the directory
        // itself.
        if emit(b"..", dir_ino, InodeType::Dir) == IterationDecision::Break {
            return Ok(false);
        }
        *pos = 2;
    }
    loop {
        let off = *pos - 2;
        if off >= dir.size {
            return Ok(true);
        }
        let de = read_entry(disk, &dir, off)?;
        if de.ino() != 0 {
            let typ = inode::read_inode(disk, sb, de.ino())?.typ;
            if emit(de.name(), de.ino(), typ) == IterationDecision::Break {
                return Ok(false);
            }
        }
        *pos += DIRENT_SIZE as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        let mut de = Dirent::empty();
        assert_eq!(de.ino(), 0);
        assert_eq!(de.name(), b"");

        de.set_ino(7);
        de.set_name(b"hello");
        assert_eq!(de.ino(), 7);
        assert_eq!(de.name(), b"hello");

        // A shorter name re-terminates; stale bytes past the NUL are
        // invisible.
        de.set_name(b"hi");
        assert_eq!(de.name(), b"hi");
    }

    #[test]
    fn name_at_limit() {
        let mut de = Dirent::empty();
        let long = [b'x'; MAXNAMELEN];
        de.set_name(&long);
        assert_eq!(de.name().len(), MAXNAMELEN);
    }
}
