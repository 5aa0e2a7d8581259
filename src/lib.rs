//! An in-memory, block-addressed file system.
//!
//! The whole file system lives in one contiguous byte image laid out as
//! 1024-byte blocks. Five layers, bottom to top:
//!   + Disk: the block array backing everything else.
//!   + Bitmap: free-block accounting, one bit per block, set = free.
//!   + Inodes: a fixed table of file records; contents hang off direct,
//!     indirect and doubly-indirect block pointers.
//!   + Directories: files whose bytes are a packed array of fixed-size
//!     entries mapping names to inode numbers.
//!   + Namespace: lookup / create / link / symlink / unlink within a
//!     directory, plus file I/O, symlink resolution and attributes.
//!
//! The engine assumes one caller at a time; the embedding runtime holds a
//! whole-filesystem lock around every operation. Nothing persists the
//! image: it is handed in and out as a boxed byte slice and dies with the
//! process.
//!
//! ```
//! use memfs::{FileMode, Fs};
//!
//! let mut fs = Fs::format(256, 32).unwrap();
//! let root = fs.root();
//! let f = fs
//!     .create(root, b"greeting", FileMode::from_bits_truncate(0o644))
//!     .unwrap();
//! fs.write(f, 0, b"hello").unwrap();
//! let mut buf = [0u8; 5];
//! fs.read(f, 0, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

#![no_std]

extern crate alloc;

mod bitmap;
mod dir;
mod disk;
mod error;
mod fs;
mod inode;
pub mod param;
mod superblock;

pub use crate::dir::IterationDecision;
pub use crate::error::{Error, Result};
pub use crate::fs::{FileMode, Fs, Ino, Metadata, SetAttr};
pub use crate::inode::InodeType;
pub use crate::superblock::Superblock;
