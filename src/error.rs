use core::fmt;

/// Failure kinds surfaced by the file system. Each corresponds to one
/// POSIX errno, which is how the embedding layer is expected to report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A name or symlink target exceeds its bound. (ENAMETOOLONG)
    NameTooLong,
    /// The name already exists in the target directory. (EEXIST)
    AlreadyExists,
    /// No entry with that name. (ENOENT)
    NotFound,
    /// No free block or no free inode. (ENOSPC)
    NoSpace,
    /// Detected on-disk inconsistency. (EIO)
    Io,
    /// Copying to or from the caller's buffer faulted. (EFAULT)
    BadAddress,
    /// The operation is not allowed on this object. (EPERM)
    NotPermitted,
    /// Malformed argument or on-disk field. (EINVAL)
    Invalid,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// The negated errno the VFS layer returns for this error.
    pub fn errno(self) -> i32 {
        match self {
            Error::NotPermitted => -1,
            Error::NotFound => -2,
            Error::Io => -5,
            Error::BadAddress => -14,
            Error::AlreadyExists => -17,
            Error::Invalid => -22,
            Error::NoSpace => -28,
            Error::NameTooLong => -36,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::NameTooLong => "name too long",
            Error::AlreadyExists => "entry already exists",
            Error::NotFound => "no such entry",
            Error::NoSpace => "no space left on device",
            Error::Io => "i/o error",
            Error::BadAddress => "bad address",
            Error::NotPermitted => "operation not permitted",
            Error::Invalid => "invalid argument",
        })
    }
}
