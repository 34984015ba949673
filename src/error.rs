//! Error types for binlog operations.
//!
//! All fallible operations in this crate return [`Result`]. Framing and
//! checksum errors encountered while loading are not surfaced to the caller:
//! the engine stops replay at the offending record and truncates the tail,
//! which is how torn writes self-heal. Errors that do reach the caller are
//! `WrongPassword` and `LockContention` from open, `NonMonotonicId` from
//! append, and I/O errors.
//!
//! Failures that would silently break durability (fsync, or unlink/rename
//! during compaction) do not return: they go through [`fatal`], which logs
//! and aborts the process.

use std::io;

use thiserror::Error;

use crate::event::{MAX_EVENT_SIZE, MIN_EVENT_SIZE};

/// Result type for binlog operations.
pub type Result<T> = std::result::Result<T, BinlogError>;

/// Errors that can occur during binlog operations.
#[derive(Debug, Error)]
pub enum BinlogError {
    /// The log is encrypted and neither the key nor the old key verifies.
    #[error("wrong binlog password")]
    WrongPassword,

    /// The size field of a record does not match the bytes backing it.
    #[error("event size mismatch: size field says {size}, frame has {len} bytes")]
    BadSize { size: usize, len: usize },

    /// The CRC32 trailer of a record does not match its contents.
    #[error("event checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadCrc { stored: u32, computed: u32 },

    /// A record claims to be larger than [`MAX_EVENT_SIZE`].
    #[error("event too big: {size} bytes (max {MAX_EVENT_SIZE})")]
    TooBig { size: usize },

    /// A record claims to be smaller than [`MIN_EVENT_SIZE`].
    #[error("event too small: {size} bytes (min {MIN_EVENT_SIZE})")]
    TooSmall { size: usize },

    /// A record's size is not a multiple of 4.
    #[error("event size {size} is not a multiple of 4")]
    BadAlignment { size: usize },

    /// An event id does not advance past the last committed id.
    #[error("non-monotonic event id {id} (last id {last_id})")]
    NonMonotonicId { id: u64, last_id: u64 },

    /// The encryption bootstrap record could not be parsed.
    #[error("malformed encryption record: {reason}")]
    BadKeyEvent { reason: &'static str },

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the exclusive lock on the binlog file.
    #[error("binlog file is locked by another process")]
    LockContention,
}

/// Logs the message and aborts the process.
///
/// Used for failures after which the on-disk log can no longer be trusted to
/// match what the engine reported as durable: a failed fsync, or a failed
/// unlink/rename while swapping in a reindexed file. Returning an error from
/// those points would leave callers holding acknowledged writes that may not
/// exist.
pub(crate) fn fatal(context: &str, err: &dyn std::fmt::Display) -> ! {
    tracing::error!(error = %err, "{context}");
    std::process::abort()
}
