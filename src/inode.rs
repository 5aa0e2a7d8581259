//! Inodes: the fixed on-disk table of file records, the block-pointer
//! tree hanging off each record, and the engines built on it.
//!
//! An inode describes a single unnamed file: its type, size, link count,
//! mode, and the blocks holding its content. Records are laid out
//! sequentially starting at the superblock's first inode block; a record
//! with a zero link count is free. Code works on an in-memory copy
//! ([`Inode`]) and writes it back explicitly, so a failed operation that
//! never calls [`write_inode`] leaves the on-disk record byte-identical.
//!
//! File content is addressed through `NDIRECT` direct pointers, one
//! indirect block, and one doubly-indirect block. Growth allocates bottom
//! up one block at a time; shrink frees top down and collapses indirect
//! blocks the moment they hold no pointers.

use arrayvec::ArrayVec;
use log::warn;
use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use core::cmp;
use core::mem;

use crate::bitmap;
use crate::disk::{Disk, Le32};
use crate::error::{Error, Result};
use crate::param::{BLKSIZE, INODESIZE, MAXFILEBLKS, MAXFILESIZE, MAXSYMLINKLEN, NDIRECT, NINDIRECT};
use crate::superblock::Superblock;

/// File type stored in an inode's `ftype` field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Regular,
    Dir,
    Symlink,
}

const FTYPE_REG: u32 = 0;
const FTYPE_DIR: u32 = 1;
const FTYPE_SYMLINK: u32 = 2;

impl InodeType {
    fn from_raw(v: u32) -> Result<InodeType> {
        match v {
            FTYPE_REG => Ok(InodeType::Regular),
            FTYPE_DIR => Ok(InodeType::Dir),
            FTYPE_SYMLINK => Ok(InodeType::Symlink),
            _ => Err(Error::Invalid),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            InodeType::Regular => FTYPE_REG,
            InodeType::Dir => FTYPE_DIR,
            InodeType::Symlink => FTYPE_SYMLINK,
        }
    }
}

/// On-disk inode record for regular files and directories.
#[repr(C)]
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
struct Dinode {
    /// File size in bytes.
    size: Le32,

    /// One of the FTYPE_* values.
    ftype: Le32,

    /// Number of links; 0 marks a free record.
    nlink: Le32,

    /// Permission bits, stored but never enforced here.
    mode: Le32,

    /// Direct data block numbers; 0 = absent.
    addr_direct: [Le32; NDIRECT],

    /// Indirect block number; 0 = absent.
    addr_indirect: Le32,

    /// Doubly-indirect block number; 0 = absent.
    addr_indirect2: Le32,
}

/// The same 64 bytes viewed as a symlink record: the pointer area holds
/// the NUL-terminated target string instead.
#[repr(C)]
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
struct DSymlink {
    size: Le32,
    ftype: Le32,
    nlink: Le32,
    mode: Le32,
    target: [u8; MAXSYMLINKLEN + 1],
}

const_assert_eq!(mem::size_of::<Dinode>(), INODESIZE);
const_assert_eq!(mem::size_of::<DSymlink>(), INODESIZE);
const_assert!(BLKSIZE % INODESIZE == 0);

/// Byte offset of the pointer / symlink area within a record.
const PTR_AREA: usize = 4 * mem::size_of::<u32>();

/// In-memory copy of one on-disk inode.
#[derive(Clone)]
pub(crate) struct Inode {
    pub typ: InodeType,
    pub nlink: u32,
    pub size: u32,
    pub mode: u32,
    pub addr_direct: [u32; NDIRECT],
    pub addr_indirect: u32,
    pub addr_indirect2: u32,
    /// Inline symlink target, valid only when `typ` is `Symlink`.
    pub symlink: [u8; MAXSYMLINKLEN + 1],
}

impl Inode {
    pub(crate) fn zeroed(typ: InodeType) -> Inode {
        Inode {
            typ,
            nlink: 0,
            size: 0,
            mode: 0,
            addr_direct: [0; NDIRECT],
            addr_indirect: 0,
            addr_indirect2: 0,
            symlink: [0; MAXSYMLINKLEN + 1],
        }
    }
}

fn record<'d>(disk: &'d Disk, sb: &Superblock, ino: u32) -> &'d [u8] {
    let off = Superblock::ioffset(ino);
    &disk.block(sb.iblock(ino))[off..off + INODESIZE]
}

fn record_mut<'d>(disk: &'d mut Disk, sb: &Superblock, ino: u32) -> &'d mut [u8] {
    let off = Superblock::ioffset(ino);
    &mut disk.block_mut(sb.iblock(ino))[off..off + INODESIZE]
}

/// Materialize the in-memory copy of inode `ino`.
pub(crate) fn read_inode(disk: &Disk, sb: &Superblock, ino: u32) -> Result<Inode> {
    if ino == 0 || ino >= sb.ninodes {
        return Err(Error::Invalid);
    }
    let raw = LayoutVerified::<_, Dinode>::new_unaligned(record(disk, sb, ino))
        .expect("inode record size");
    let mut ip = Inode::zeroed(InodeType::from_raw(raw.ftype.get())?);
    ip.nlink = raw.nlink.get();
    ip.size = raw.size.get();
    ip.mode = raw.mode.get();
    if ip.typ == InodeType::Symlink {
        let raw = LayoutVerified::<_, DSymlink>::new_unaligned(record(disk, sb, ino))
            .expect("inode record size");
        ip.symlink = raw.target;
    } else {
        for (d, s) in ip.addr_direct.iter_mut().zip(raw.addr_direct.iter()) {
            *d = s.get();
        }
        ip.addr_indirect = raw.addr_indirect.get();
        ip.addr_indirect2 = raw.addr_indirect2.get();
    }
    Ok(ip)
}

/// Copy a modified in-memory inode back to its record. Must be called
/// after every change that should stick.
pub(crate) fn write_inode(disk: &mut Disk, sb: &Superblock, ino: u32, ip: &Inode) {
    debug_assert!(ino != 0 && ino < sb.ninodes);
    match ip.typ {
        InodeType::Symlink => {
            let raw = DSymlink {
                size: Le32::new(ip.size),
                ftype: Le32::new(ip.typ.to_raw()),
                nlink: Le32::new(ip.nlink),
                mode: Le32::new(ip.mode),
                target: ip.symlink,
            };
            record_mut(disk, sb, ino).copy_from_slice(raw.as_bytes());
        }
        _ => {
            let mut addr_direct = [Le32::new(0); NDIRECT];
            for (d, s) in addr_direct.iter_mut().zip(ip.addr_direct.iter()) {
                *d = Le32::new(*s);
            }
            let raw = Dinode {
                size: Le32::new(ip.size),
                ftype: Le32::new(ip.typ.to_raw()),
                nlink: Le32::new(ip.nlink),
                mode: Le32::new(ip.mode),
                addr_direct,
                addr_indirect: Le32::new(ip.addr_indirect),
                addr_indirect2: Le32::new(ip.addr_indirect2),
            };
            record_mut(disk, sb, ino).copy_from_slice(raw.as_bytes());
        }
    }
}

/// Link count of `ino`, read straight off the record.
pub(crate) fn nlink_of(disk: &Disk, sb: &Superblock, ino: u32) -> u32 {
    let raw = LayoutVerified::<_, Dinode>::new_unaligned(record(disk, sb, ino))
        .expect("inode record size");
    raw.nlink.get()
}

/// First free inode, if any. Inode 0 is reserved. The caller owns zeroing
/// the record before storing anything.
pub(crate) fn find_free_inode(disk: &Disk, sb: &Superblock) -> Option<u32> {
    (1..sb.ninodes).find(|&ino| nlink_of(disk, sb, ino) == 0)
}

/// Wipe a record, returning the slot to its never-used state.
pub(crate) fn zero_inode(disk: &mut Disk, sb: &Superblock, ino: u32) {
    record_mut(disk, sb, ino).fill(0);
}

/// Raw NUL-terminated symlink target of `ino`, borrowed from the image.
pub(crate) fn symlink_target<'d>(disk: &'d Disk, sb: &Superblock, ino: u32) -> &'d [u8] {
    let area = &record(disk, sb, ino)[PTR_AREA..INODESIZE];
    let len = area.iter().position(|&c| c == 0).unwrap_or(MAXSYMLINKLEN);
    &area[..len]
}

/// Where file block `b` lives in the pointer tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BlockPos {
    Direct(usize),
    /// Slot within the indirect block.
    Indirect(usize),
    /// Slot within the doubly-indirect block, then within that indirect.
    Indirect2 { indir: usize, direct: usize },
}

/// Slot of file block `b`, or `None` past the largest representable file.
pub(crate) fn block_pos(b: usize) -> Option<BlockPos> {
    if b < NDIRECT {
        Some(BlockPos::Direct(b))
    } else if b < NDIRECT + NINDIRECT {
        Some(BlockPos::Indirect(b - NDIRECT))
    } else if b < MAXFILEBLKS {
        let off = b - NDIRECT - NINDIRECT;
        Some(BlockPos::Indirect2 {
            indir: off / NINDIRECT,
            direct: off % NINDIRECT,
        })
    } else {
        None
    }
}

/// Number of blocks holding `size` bytes.
pub(crate) fn blocks_for(size: u32) -> usize {
    (size as usize + BLKSIZE - 1) / BLKSIZE
}

/// Whether a pointer read off the tree names a real block. Zero means
/// absent; past the end of the disk means the record is corrupt. Either
/// way it must not reach the block device.
fn valid_blockno(disk: &Disk, bno: u32) -> bool {
    bno != 0 && bno < disk.nblocks()
}

/// A pointer read off the tree must land in the data region; anything
/// else is corruption.
fn check_blockno(sb: &Superblock, bno: u32) -> Result<()> {
    if bno < sb.first_data_block() || bno >= sb.nblocks {
        warn!("block pointer {} out of range", bno);
        return Err(Error::Io);
    }
    Ok(())
}

/// Physical block holding the byte at `off`. `Ok(None)` for offsets at or
/// past the end of the file and for symlinks; a zero or out-of-range
/// pointer somewhere the tree shape requires one is corruption.
pub(crate) fn block_of(disk: &Disk, ip: &Inode, off: u32) -> Result<Option<u32>> {
    if ip.typ == InodeType::Symlink || off >= ip.size {
        return Ok(None);
    }
    let pos = match block_pos(off as usize / BLKSIZE) {
        Some(pos) => pos,
        None => return Err(Error::Io),
    };
    let bno = match pos {
        BlockPos::Direct(i) => ip.addr_direct[i],
        BlockPos::Indirect(i) => {
            if !valid_blockno(disk, ip.addr_indirect) {
                return Err(Error::Io);
            }
            disk.table(ip.addr_indirect)[i].get()
        }
        BlockPos::Indirect2 { indir, direct } => {
            if !valid_blockno(disk, ip.addr_indirect2) {
                return Err(Error::Io);
            }
            let mid = disk.table(ip.addr_indirect2)[indir].get();
            if !valid_blockno(disk, mid) {
                return Err(Error::Io);
            }
            disk.table(mid)[direct].get()
        }
    };
    if !valid_blockno(disk, bno) {
        warn!("bad block pointer at byte offset {}", off);
        return Err(Error::Io);
    }
    Ok(Some(bno))
}

fn alloc_staged(disk: &mut Disk, sb: &Superblock, staged: &mut ArrayVec<u32, 3>) -> Result<u32> {
    let bno = bitmap::allocate(disk, sb).ok_or(Error::NoSpace)?;
    disk.zero_block(bno);
    staged.push(bno);
    Ok(bno)
}

/// Allocate everything one new tail block needs, then wire the pointers.
/// Nothing is wired until every allocation has succeeded, which keeps the
/// caller's rollback a pure bitmap operation.
fn grow_at(
    disk: &mut Disk,
    sb: &Superblock,
    ip: &mut Inode,
    pos: BlockPos,
    staged: &mut ArrayVec<u32, 3>,
) -> Result<()> {
    match pos {
        BlockPos::Direct(i) => {
            let data = alloc_staged(disk, sb, staged)?;
            ip.addr_direct[i] = data;
        }
        BlockPos::Indirect(i) => {
            let (indir, new_indir) = match ip.addr_indirect {
                0 => (alloc_staged(disk, sb, staged)?, true),
                n => {
                    check_blockno(sb, n)?;
                    (n, false)
                }
            };
            let data = alloc_staged(disk, sb, staged)?;
            if new_indir {
                ip.addr_indirect = indir;
            }
            disk.table_mut(indir)[i].set(data);
        }
        BlockPos::Indirect2 { indir, direct } => {
            let (ind2, new_ind2) = match ip.addr_indirect2 {
                0 => (alloc_staged(disk, sb, staged)?, true),
                n => {
                    check_blockno(sb, n)?;
                    (n, false)
                }
            };
            let existing = disk.table(ind2)[indir].get();
            let (mid, new_mid) = match existing {
                0 => (alloc_staged(disk, sb, staged)?, true),
                n => {
                    check_blockno(sb, n)?;
                    (n, false)
                }
            };
            let data = alloc_staged(disk, sb, staged)?;
            if new_ind2 {
                ip.addr_indirect2 = ind2;
            }
            if new_mid {
                disk.table_mut(ind2)[indir].set(mid);
            }
            disk.table_mut(mid)[direct].set(data);
        }
    }
    Ok(())
}

/// Append one zeroed block to the file, extending the pointer tree as
/// needed. On failure every staged allocation is returned to the bitmap
/// and the on-disk record is untouched.
pub(crate) fn add_block(disk: &mut Disk, sb: &Superblock, ino: u32) -> Result<()> {
    let mut ip = read_inode(disk, sb, ino)?;
    debug_assert!(ip.typ != InodeType::Symlink);
    let n = blocks_for(ip.size);
    let pos = match block_pos(n) {
        Some(pos) => pos,
        None => return Err(Error::Io),
    };

    let mut staged: ArrayVec<u32, 3> = ArrayVec::new();
    match grow_at(disk, sb, &mut ip, pos, &mut staged) {
        Ok(()) => {
            ip.size = (n as u32 + 1) * BLKSIZE as u32;
            write_inode(disk, sb, ino, &ip);
            Ok(())
        }
        Err(err) => {
            // Undo in reverse allocation order.
            while let Some(bno) = staged.pop() {
                bitmap::free(disk, sb, bno);
            }
            Err(err)
        }
    }
}

/// Free the file's last block, collapsing indirect blocks that end up
/// empty. `Io` when a pointer the tree shape requires is missing; the
/// size is unchanged in that case.
pub(crate) fn remove_block(disk: &mut Disk, sb: &Superblock, ino: u32) -> Result<()> {
    let mut ip = read_inode(disk, sb, ino)?;
    let n = blocks_for(ip.size);
    if n == 0 {
        return Err(Error::Io);
    }
    let pos = match block_pos(n - 1) {
        Some(pos) => pos,
        None => return Err(Error::Io),
    };
    match pos {
        BlockPos::Direct(i) => {
            let data = ip.addr_direct[i];
            check_blockno(sb, data)?;
            bitmap::free(disk, sb, data);
            ip.addr_direct[i] = 0;
        }
        BlockPos::Indirect(i) => {
            check_blockno(sb, ip.addr_indirect)?;
            let data = disk.table(ip.addr_indirect)[i].get();
            check_blockno(sb, data)?;
            bitmap::free(disk, sb, data);
            disk.table_mut(ip.addr_indirect)[i].set(0);
            if i == 0 {
                // That was the indirect's last pointer.
                bitmap::free(disk, sb, ip.addr_indirect);
                ip.addr_indirect = 0;
            }
        }
        BlockPos::Indirect2 { indir, direct } => {
            check_blockno(sb, ip.addr_indirect2)?;
            let mid = disk.table(ip.addr_indirect2)[indir].get();
            check_blockno(sb, mid)?;
            let data = disk.table(mid)[direct].get();
            check_blockno(sb, data)?;
            bitmap::free(disk, sb, data);
            disk.table_mut(mid)[direct].set(0);
            if direct == 0 {
                bitmap::free(disk, sb, mid);
                disk.table_mut(ip.addr_indirect2)[indir].set(0);
                if indir == 0 {
                    bitmap::free(disk, sb, ip.addr_indirect2);
                    ip.addr_indirect2 = 0;
                }
            }
        }
    }
    let rem = ip.size % BLKSIZE as u32;
    ip.size -= if rem != 0 { rem } else { BLKSIZE as u32 };
    write_inode(disk, sb, ino, &ip);
    Ok(())
}

/// Grow or shrink `ino` to exactly `want` bytes, one block at a time.
/// Growth that runs out of space puts the file back to its entry size
/// before reporting `NoSpace`; new blocks arrive zeroed.
pub(crate) fn change_size(disk: &mut Disk, sb: &Superblock, ino: u32, want: u32) -> Result<()> {
    if want > MAXFILESIZE {
        return Err(Error::NoSpace);
    }
    let old_size = read_inode(disk, sb, ino)?.size;
    let want_blocks = blocks_for(want);

    while blocks_for(read_inode(disk, sb, ino)?.size) < want_blocks {
        match add_block(disk, sb, ino) {
            Ok(()) => {}
            Err(Error::NoSpace) => {
                while blocks_for(read_inode(disk, sb, ino)?.size) > blocks_for(old_size) {
                    remove_block(disk, sb, ino)?;
                }
                let mut ip = read_inode(disk, sb, ino)?;
                ip.size = old_size;
                write_inode(disk, sb, ino, &ip);
                return Err(Error::NoSpace);
            }
            Err(err) => return Err(err),
        }
    }
    while blocks_for(read_inode(disk, sb, ino)?.size) > want_blocks {
        remove_block(disk, sb, ino)?;
    }
    let mut ip = read_inode(disk, sb, ino)?;
    ip.size = want;
    write_inode(disk, sb, ino, &ip);
    Ok(())
}

/// Stream the bytes in `[off, off + n)` through `copy`, one in-block run
/// at a time. `copy` gets the offset within the transfer and the source
/// window; a failing `copy` models a faulting destination buffer. Reads
/// never go past the end of the file.
pub(crate) fn read_with<F>(disk: &Disk, ip: &Inode, off: u32, n: u32, mut copy: F) -> Result<usize>
where
    F: FnMut(usize, &[u8]) -> core::result::Result<(), ()>,
{
    if n == 0 || off >= ip.size {
        return Ok(0);
    }
    let n = cmp::min(n, ip.size - off) as usize;
    let mut tot = 0;
    while tot < n {
        let pos = off as usize + tot;
        let bno = block_of(disk, ip, pos as u32)?.ok_or(Error::Io)?;
        let begin = pos % BLKSIZE;
        let m = cmp::min(n - tot, BLKSIZE - begin);
        if copy(tot, &disk.block(bno)[begin..begin + m]).is_err() {
            return if tot == 0 { Err(Error::BadAddress) } else { Ok(tot) };
        }
        tot += m;
    }
    Ok(tot)
}

/// Write `[off, off + n)` through `copy`, growing the file first so every
/// allocation happens before the first byte moves. Blocks added for a
/// transfer that then faults stay with the file; their content past the
/// fault is indeterminate.
pub(crate) fn write_with<F>(
    disk: &mut Disk,
    sb: &Superblock,
    ino: u32,
    off: u32,
    n: u32,
    mut copy: F,
) -> Result<usize>
where
    F: FnMut(usize, &mut [u8]) -> core::result::Result<(), ()>,
{
    if n == 0 {
        return Ok(0);
    }
    let end = off.checked_add(n).ok_or(Error::Invalid)?;
    if end > read_inode(disk, sb, ino)?.size {
        change_size(disk, sb, ino, end)?;
    }
    let ip = read_inode(disk, sb, ino)?;
    let n = n as usize;
    let mut tot = 0;
    while tot < n {
        let pos = off as usize + tot;
        let bno = block_of(disk, &ip, pos as u32)?.ok_or(Error::Io)?;
        let begin = pos % BLKSIZE;
        let m = cmp::min(n - tot, BLKSIZE - begin);
        if copy(tot, &mut disk.block_mut(bno)[begin..begin + m]).is_err() {
            return if tot == 0 { Err(Error::BadAddress) } else { Ok(tot) };
        }
        tot += m;
    }
    Ok(tot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_positions() {
        assert_eq!(block_pos(0), Some(BlockPos::Direct(0)));
        assert_eq!(block_pos(NDIRECT - 1), Some(BlockPos::Direct(NDIRECT - 1)));
        assert_eq!(block_pos(NDIRECT), Some(BlockPos::Indirect(0)));
        assert_eq!(
            block_pos(NDIRECT + NINDIRECT - 1),
            Some(BlockPos::Indirect(NINDIRECT - 1))
        );
        assert_eq!(
            block_pos(NDIRECT + NINDIRECT),
            Some(BlockPos::Indirect2 { indir: 0, direct: 0 })
        );
        assert_eq!(
            block_pos(NDIRECT + NINDIRECT + NINDIRECT),
            Some(BlockPos::Indirect2 { indir: 1, direct: 0 })
        );
        assert_eq!(
            block_pos(MAXFILEBLKS - 1),
            Some(BlockPos::Indirect2 {
                indir: NINDIRECT - 1,
                direct: NINDIRECT - 1
            })
        );
        assert_eq!(block_pos(MAXFILEBLKS), None);
    }

    #[test]
    fn block_counts() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(BLKSIZE as u32), 1);
        assert_eq!(blocks_for(BLKSIZE as u32 + 1), 2);
    }
}
