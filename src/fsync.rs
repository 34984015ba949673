//! Durability primitives with the binlog's failure policy folded in.
//!
//! Two kinds of fsync keep the log durable: file syncs, which make record
//! bytes permanent, and parent-directory syncs, which make the file's very
//! existence permanent (its creation, or the rename that swaps in a
//! reindexed replacement). Without the directory sync, a power loss can
//! forget the entry even though the file contents were synced.
//!
//! File syncs abort the process on failure: a sync that fails leaves no
//! honest way to tell the caller which acknowledged writes survived, so the
//! engine stops rather than vouch for data it cannot. Parent-directory
//! syncs return the error instead; whether the entry's loss is recoverable
//! depends on what the call site just did, and the reindex swap escalates
//! it to fatal itself.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::fatal;

/// Forces file contents and metadata to disk; aborts on failure.
pub(crate) fn fsync_file_or_die(file: &File, context: &str) {
    if let Err(e) = file.sync_all() {
        fatal(context, &e);
    }
}

/// Makes `path`'s directory entry durable by fsyncing its parent directory.
///
/// A bare filename has an empty parent; the current directory stands in so
/// a relative binlog path still gets a durable entry.
pub(crate) fn fsync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}
