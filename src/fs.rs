//! The file system proper: image formatting and opening, namespace
//! operations, file I/O, attributes, and the consistency checker.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use core::convert::TryFrom;
use log::{debug, info, warn};

use crate::bitmap;
use crate::dir::{self, Dirent, IterationDecision};
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::inode::{self, Inode, InodeType};
use crate::param::{
    BLKSIZE, BPB, FREEMAP_BLK, IPB, MAXNAMELEN, MAXSYMLINKLEN, NDIRECT, NINDIRECT, ROOTINO,
};
use crate::superblock::Superblock;

/// Inode number. 0 is reserved; the root directory is [`crate::param::ROOTINO`].
pub type Ino = u32;

bitflags! {
    /// Permission bits stored in an inode's mode field. The engine stores
    /// them verbatim and never enforces them.
    pub struct FileMode: u32 {
        const SETUID = 0o4000;
        const SETGID = 0o2000;
        const STICKY = 0o1000;
        const OWNER_R = 0o400;
        const OWNER_W = 0o200;
        const OWNER_X = 0o100;
        const GROUP_R = 0o040;
        const GROUP_W = 0o020;
        const GROUP_X = 0o010;
        const OTHER_R = 0o004;
        const OTHER_W = 0o002;
        const OTHER_X = 0o001;
    }
}

/// Everything user-visible about one inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub ino: Ino,
    pub typ: InodeType,
    pub nlink: u32,
    pub size: u32,
    pub mode: FileMode,
}

/// Attribute changes for [`Fs::set_attr`]; `None` fields are left alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    pub size: Option<u32>,
    pub mode: Option<FileMode>,
}

/// An in-memory block-addressed file system. All operations assume a
/// single caller at a time; the embedding runtime serializes access.
#[derive(Debug)]
pub struct Fs {
    disk: Disk,
    sb: Superblock,
}

impl Fs {
    /// Build a fresh image with `nblocks` blocks and `ninodes` inode-table
    /// slots, containing only an empty root directory.
    pub fn format(nblocks: u32, ninodes: u32) -> Result<Fs> {
        // Geometry in u64: the sums must not wrap before validation.
        let bitmap_blocks = ((nblocks as u64 + BPB as u64 - 1) / BPB as u64) as u32;
        let firstinob = FREEMAP_BLK + bitmap_blocks;
        let inode_blocks = ((ninodes as u64 + IPB as u64 - 1) / IPB as u64) as u32;
        let first_data = firstinob as u64 + inode_blocks as u64;
        if ninodes < 2 || first_data >= nblocks as u64 {
            return Err(Error::Invalid);
        }
        let first_data = first_data as u32;

        let mut disk = Disk::new(nblocks);
        let sb = Superblock { nblocks, ninodes, firstinob };
        sb.write(&mut disk);
        for bno in first_data..nblocks {
            bitmap::free(&mut disk, &sb, bno);
        }

        let mut root = Inode::zeroed(InodeType::Dir);
        root.nlink = 1;
        root.mode = 0o755;
        inode::write_inode(&mut disk, &sb, ROOTINO, &root);

        info!(
            "formatted {} blocks ({} bitmap, {} inode holding {} inodes, {} data)",
            nblocks,
            bitmap_blocks,
            inode_blocks,
            ninodes,
            nblocks - first_data
        );
        Ok(Fs { disk, sb })
    }

    /// Mount an existing image.
    pub fn open(image: Box<[u8]>) -> Result<Fs> {
        let disk = Disk::from_image(image)?;
        let sb = Superblock::read(&disk)?;
        let fs = Fs { disk, sb };
        let root = fs.inode(ROOTINO)?;
        if root.typ != InodeType::Dir || root.nlink == 0 {
            return Err(Error::Invalid);
        }
        Ok(fs)
    }

    /// Take the raw image back.
    pub fn into_image(self) -> Box<[u8]> {
        self.disk.into_image()
    }

    /// Raw bytes of the image.
    pub fn image(&self) -> &[u8] {
        self.disk.image()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Root directory inode number.
    pub fn root(&self) -> Ino {
        ROOTINO
    }

    fn inode(&self, ino: Ino) -> Result<Inode> {
        inode::read_inode(&self.disk, &self.sb, ino)
    }

    fn dir_inode(&self, dir: Ino) -> Result<Inode> {
        let ip = self.inode(dir)?;
        if ip.typ != InodeType::Dir {
            return Err(Error::Invalid);
        }
        Ok(ip)
    }

    fn check_name(name: &[u8]) -> Result<()> {
        if name.is_empty() || name.contains(&0) {
            return Err(Error::Invalid);
        }
        if name.len() > MAXNAMELEN {
            return Err(Error::NameTooLong);
        }
        Ok(())
    }

    /// Find `name` in `dir`. `Ok(None)` is the negative answer: the name
    /// is known to be absent.
    pub fn lookup(&self, dir: Ino, name: &[u8]) -> Result<Option<Ino>> {
        if name.len() > MAXNAMELEN {
            return Err(Error::NameTooLong);
        }
        let dp = self.dir_inode(dir)?;
        match dir::find_entry(&self.disk, &dp, name)? {
            Some(off) => {
                let de = dir::read_entry(&self.disk, &dp, off)?;
                // Materialize the target; a record with an unknown type
                // must not produce a binding.
                self.inode(de.ino())?;
                Ok(Some(de.ino()))
            }
            None => Ok(None),
        }
    }

    /// Create a regular file named `name` in `dir`.
    pub fn create(&mut self, dir: Ino, name: &[u8], mode: FileMode) -> Result<Ino> {
        Self::check_name(name)?;
        let dp = self.dir_inode(dir)?;
        if dir::find_entry(&self.disk, &dp, name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let off = dir::create_blank_entry(&mut self.disk, &self.sb, dir)?;
        // Failing past this point leaves the slot tombstoned, which a
        // later create will reuse.
        let ino = inode::find_free_inode(&self.disk, &self.sb).ok_or(Error::NoSpace)?;

        let mut ip = Inode::zeroed(InodeType::Regular);
        ip.nlink = 1;
        ip.mode = mode.bits();
        inode::write_inode(&mut self.disk, &self.sb, ino, &ip);

        let mut de = Dirent::empty();
        de.set_ino(ino);
        de.set_name(name);
        let dp = self.dir_inode(dir)?;
        dir::write_entry(&mut self.disk, &dp, off, &de)?;
        debug!("create: ino {} in dir {}", ino, dir);
        Ok(ino)
    }

    /// Hard-link `src` into `dir` under `name`.
    pub fn link(&mut self, src: Ino, dir: Ino, name: &[u8]) -> Result<()> {
        // Validate the name before anything is allocated, so a bad name
        // leaves no stray tombstone behind.
        Self::check_name(name)?;
        let mut sp = self.inode(src)?;
        if sp.typ == InodeType::Dir {
            return Err(Error::Invalid);
        }
        let dp = self.dir_inode(dir)?;
        if dir::find_entry(&self.disk, &dp, name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let off = dir::create_blank_entry(&mut self.disk, &self.sb, dir)?;

        let mut de = Dirent::empty();
        de.set_ino(src);
        de.set_name(name);
        let dp = self.dir_inode(dir)?;
        dir::write_entry(&mut self.disk, &dp, off, &de)?;

        sp.nlink += 1;
        inode::write_inode(&mut self.disk, &self.sb, src, &sp);
        debug!("link: ino {} into dir {}", src, dir);
        Ok(())
    }

    /// Create a symbolic link `name` -> `target` in `dir`. A target of
    /// the form `root?A:B` resolves per-user at follow time.
    pub fn symlink(&mut self, dir: Ino, name: &[u8], target: &[u8]) -> Result<Ino> {
        Self::check_name(name)?;
        if target.contains(&0) {
            return Err(Error::Invalid);
        }
        if target.len() > MAXSYMLINKLEN {
            return Err(Error::NameTooLong);
        }
        let dp = self.dir_inode(dir)?;
        if dir::find_entry(&self.disk, &dp, name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let ino = inode::find_free_inode(&self.disk, &self.sb).ok_or(Error::NoSpace)?;
        let off = dir::create_blank_entry(&mut self.disk, &self.sb, dir)?;

        let mut ip = Inode::zeroed(InodeType::Symlink);
        ip.nlink = 1;
        ip.size = target.len() as u32;
        ip.mode = 0o777;
        ip.symlink[..target.len()].copy_from_slice(target);
        inode::write_inode(&mut self.disk, &self.sb, ino, &ip);

        let mut de = Dirent::empty();
        de.set_ino(ino);
        de.set_name(name);
        let dp = self.dir_inode(dir)?;
        dir::write_entry(&mut self.disk, &dp, off, &de)?;
        debug!("symlink: ino {} in dir {}", ino, dir);
        Ok(ino)
    }

    /// Remove `name` from `dir`. Dropping the last link releases the
    /// file's blocks and returns its inode record to the free pool.
    pub fn unlink(&mut self, dir: Ino, name: &[u8]) -> Result<()> {
        let dp = self.dir_inode(dir)?;
        let off = dir::find_entry(&self.disk, &dp, name)?.ok_or(Error::NotFound)?;
        let mut de = dir::read_entry(&self.disk, &dp, off)?;
        let target = de.ino();
        de.set_ino(0);
        dir::write_entry(&mut self.disk, &dp, off, &de)?;

        let mut tp = self.inode(target)?;
        assert!(tp.nlink >= 1, "unlink: nlink < 1");
        tp.nlink -= 1;
        inode::write_inode(&mut self.disk, &self.sb, target, &tp);
        if tp.nlink == 0 {
            // Symlink payloads are inline; everything else may own blocks.
            if tp.typ != InodeType::Symlink {
                inode::change_size(&mut self.disk, &self.sb, target, 0)?;
            }
            inode::zero_inode(&mut self.disk, &self.sb, target);
        }
        debug!("unlink: ino {} from dir {}", target, dir);
        Ok(())
    }

    /// Stream `dir`'s entries through `emit`, resuming from `*pos` (start
    /// at 0). `"."` and `".."` come first. Returns `Ok(true)` at the end
    /// of the directory, `Ok(false)` if `emit` stopped the iteration; the
    /// cursor then resumes at the refused entry.
    pub fn readdir<F>(&self, dir: Ino, pos: &mut u32, emit: F) -> Result<bool>
    where
        F: FnMut(&[u8], Ino, InodeType) -> IterationDecision,
    {
        dir::readdir(&self.disk, &self.sb, dir, pos, emit)
    }

    /// Read into `buf` starting at `off`, clamped to the end of the file.
    pub fn read(&self, ino: Ino, off: u32, buf: &mut [u8]) -> Result<usize> {
        let len = u32::try_from(buf.len()).map_err(|_| Error::Invalid)?;
        self.read_with(ino, off, len, |pos, src| {
            buf[pos..pos + src.len()].copy_from_slice(src);
            Ok(())
        })
    }

    /// Read `len` bytes from `off` through `copy`, one in-block run at a
    /// time. A failing `copy` models a faulting destination buffer: the
    /// transfer stops and the bytes copied so far are reported, or
    /// [`Error::BadAddress`] if nothing was.
    pub fn read_with<F>(&self, ino: Ino, off: u32, len: u32, copy: F) -> Result<usize>
    where
        F: FnMut(usize, &[u8]) -> core::result::Result<(), ()>,
    {
        let ip = self.inode(ino)?;
        if ip.typ != InodeType::Regular {
            return Err(Error::Invalid);
        }
        inode::read_with(&self.disk, &ip, off, len, copy)
    }

    /// Write `buf` at `off`, growing the file as needed. Writing past the
    /// end materializes the gap as zeroed blocks.
    pub fn write(&mut self, ino: Ino, off: u32, buf: &[u8]) -> Result<usize> {
        let len = u32::try_from(buf.len()).map_err(|_| Error::Invalid)?;
        self.write_with(ino, off, len, |pos, dst| {
            dst.copy_from_slice(&buf[pos..pos + dst.len()]);
            Ok(())
        })
    }

    /// Write `len` bytes at `off` through `copy`. All growth happens
    /// before the first byte moves; blocks added for a transfer that then
    /// faults stay with the file.
    pub fn write_with<F>(&mut self, ino: Ino, off: u32, len: u32, copy: F) -> Result<usize>
    where
        F: FnMut(usize, &mut [u8]) -> core::result::Result<(), ()>,
    {
        let ip = self.inode(ino)?;
        if ip.typ != InodeType::Regular {
            return Err(Error::Invalid);
        }
        inode::write_with(&mut self.disk, &self.sb, ino, off, len, copy)
    }

    /// Write `buf` at the current end of the file.
    pub fn append(&mut self, ino: Ino, buf: &[u8]) -> Result<usize> {
        let size = self.inode(ino)?.size;
        self.write(ino, size, buf)
    }

    /// Resolve a symlink's target for the given user: `root?A:B` picks
    /// `A` for uid 0 and `B` for everyone else; any other target resolves
    /// verbatim. The stored string is never modified.
    pub fn follow_symlink(&self, ino: Ino, uid: u32) -> Result<&[u8]> {
        let ip = self.inode(ino)?;
        if ip.typ != InodeType::Symlink {
            return Err(Error::Invalid);
        }
        let target = inode::symlink_target(&self.disk, &self.sb, ino);
        if let Some(rest) = target.strip_prefix(b"root?".as_ref()) {
            if let Some(colon) = rest.iter().position(|&c| c == b':') {
                return Ok(if uid == 0 { &rest[..colon] } else { &rest[colon + 1..] });
            }
        }
        Ok(target)
    }

    /// Materialize the user-visible attributes of `ino`.
    pub fn metadata(&self, ino: Ino) -> Result<Metadata> {
        let ip = self.inode(ino)?;
        Ok(Metadata {
            ino,
            typ: ip.typ,
            nlink: ip.nlink,
            size: ip.size,
            mode: FileMode::from_bits_truncate(ip.mode),
        })
    }

    /// Apply attribute changes: size runs through the growth engine, mode
    /// is stored verbatim. Directory sizes cannot be changed this way.
    pub fn set_attr(&mut self, ino: Ino, attr: SetAttr) -> Result<()> {
        let ip = self.inode(ino)?;
        if let Some(size) = attr.size {
            match ip.typ {
                InodeType::Dir => return Err(Error::NotPermitted),
                InodeType::Symlink => return Err(Error::Invalid),
                InodeType::Regular => inode::change_size(&mut self.disk, &self.sb, ino, size)?,
            }
        }
        if let Some(mode) = attr.mode {
            let mut ip = self.inode(ino)?;
            ip.mode = mode.bits();
            inode::write_inode(&mut self.disk, &self.sb, ino, &ip);
        }
        Ok(())
    }

    /// Audit the on-disk invariants: every live inode's pointer tree has
    /// exactly the shape its size dictates, no block is shared or out of
    /// range, directory sizes are block multiples, and the bitmap agrees
    /// with the set of referenced blocks in both directions.
    pub fn fsck(&self) -> Result<()> {
        let mut owner: Vec<Option<Ino>> = vec![None; self.sb.nblocks as usize];

        for ino in 1..self.sb.ninodes {
            if inode::nlink_of(&self.disk, &self.sb, ino) == 0 {
                continue;
            }
            let ip = self.inode(ino)?;
            match ip.typ {
                InodeType::Symlink => {
                    if ip.size as usize > MAXSYMLINKLEN {
                        warn!("fsck: symlink {} target too long", ino);
                        return Err(Error::Io);
                    }
                    continue;
                }
                InodeType::Dir => {
                    if ip.size as usize % BLKSIZE != 0 {
                        warn!("fsck: directory {} size {} not block-aligned", ino, ip.size);
                        return Err(Error::Io);
                    }
                }
                InodeType::Regular => {}
            }

            let n = inode::blocks_for(ip.size);
            for k in 0..n {
                let bno = inode::block_of(&self.disk, &ip, (k * BLKSIZE) as u32)?
                    .ok_or(Error::Io)?;
                self.claim(&mut owner, ino, bno)?;
            }
            for k in n..NDIRECT {
                if ip.addr_direct[k] != 0 {
                    warn!("fsck: ino {} has a stale direct pointer", ino);
                    return Err(Error::Io);
                }
            }

            if n <= NDIRECT {
                if ip.addr_indirect != 0 {
                    warn!("fsck: ino {} has a stale indirect block", ino);
                    return Err(Error::Io);
                }
            } else {
                self.claim(&mut owner, ino, ip.addr_indirect)?;
                let used = core::cmp::min(n - NDIRECT, NINDIRECT);
                let table = self.disk.table(ip.addr_indirect);
                for slot in used..NINDIRECT {
                    if table[slot].get() != 0 {
                        warn!("fsck: ino {} has a stale indirect pointer", ino);
                        return Err(Error::Io);
                    }
                }
            }

            if n <= NDIRECT + NINDIRECT {
                if ip.addr_indirect2 != 0 {
                    warn!("fsck: ino {} has a stale doubly-indirect block", ino);
                    return Err(Error::Io);
                }
            } else {
                self.claim(&mut owner, ino, ip.addr_indirect2)?;
                let past = n - NDIRECT - NINDIRECT;
                let mids = (past + NINDIRECT - 1) / NINDIRECT;
                let table2 = self.disk.table(ip.addr_indirect2);
                for slot in 0..NINDIRECT {
                    let mid = table2[slot].get();
                    if slot >= mids {
                        if mid != 0 {
                            warn!("fsck: ino {} has a stale indirect pointer", ino);
                            return Err(Error::Io);
                        }
                        continue;
                    }
                    if mid == 0 {
                        warn!("fsck: ino {} is missing an indirect block", ino);
                        return Err(Error::Io);
                    }
                    self.claim(&mut owner, ino, mid)?;
                    let used = core::cmp::min(past - slot * NINDIRECT, NINDIRECT);
                    let table = self.disk.table(mid);
                    for dslot in used..NINDIRECT {
                        if table[dslot].get() != 0 {
                            warn!("fsck: ino {} has a stale indirect pointer", ino);
                            return Err(Error::Io);
                        }
                    }
                }
            }
        }

        for bno in self.sb.first_data_block()..self.sb.nblocks {
            let allocated = bitmap::is_allocated(&self.disk, bno);
            let owned = owner[bno as usize].is_some();
            if allocated && !owned {
                warn!("fsck: block {} leaked", bno);
                return Err(Error::Io);
            }
            if !allocated && owned {
                warn!("fsck: block {} in use but marked free", bno);
                return Err(Error::Io);
            }
        }
        Ok(())
    }

    fn claim(&self, owner: &mut [Option<Ino>], ino: Ino, bno: u32) -> Result<()> {
        if bno < self.sb.first_data_block() || bno >= self.sb.nblocks {
            warn!("fsck: ino {} references out-of-range block {}", ino, bno);
            return Err(Error::Io);
        }
        if !bitmap::is_allocated(&self.disk, bno) {
            warn!("fsck: ino {} references free block {}", ino, bno);
            return Err(Error::Io);
        }
        if let Some(prev) = owner[bno as usize] {
            warn!("fsck: block {} shared by inodes {} and {}", bno, prev, ino);
            return Err(Error::Io);
        }
        owner[bno as usize] = Some(ino);
        Ok(())
    }
}
