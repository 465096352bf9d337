//! Error taxonomy for the store.
//!
//! Every variant corresponds to one failure mode a caller can act on
//! distinctly; anything below that line surfaces as [`Error::Io`] so callers
//! never have to guess whether a `std::io::Error` was swallowed.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `open()` was called with an open flag other than `r`, `w`, `c`, `n`.
    #[error("unknown open flag {0:?}, expected one of 'r', 'w', 'c', 'n'")]
    BadFlag(char),

    /// The path does not exist and the flag did not permit creating it, or
    /// the requested key is not present for an operation that requires it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The advisory lock could not be acquired because another process
    /// already holds it.
    #[error("file is locked by another process")]
    Locked,

    /// The header magic/version did not match, a length field pointed past
    /// the end of the file, or a chain walk exceeded the block count bound.
    #[error("corrupt file: {0}")]
    Corrupt(String),

    /// A mutating operation was attempted on a handle opened for reading.
    #[error("file is open for read only")]
    ReadOnly,

    /// A value of the wrong shape was supplied: a key longer than the
    /// header's key-length field can express, or a value of the wrong
    /// length for a fixed-value-length store.
    #[error("type error: {0}")]
    Type(String),

    /// A timestamp operation was attempted on a store opened/created
    /// without the timestamp flag.
    #[error("timestamps were not initialized for this file")]
    NoTimestamps,

    /// Any I/O failure not otherwise classified above.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn type_err(msg: impl Into<String>) -> Self {
        Error::Type(msg.into())
    }
}
