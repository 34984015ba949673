//! Append-only, optionally encrypted binary event log.
//!
//! This crate provides a durable write-ahead event store: clients append
//! framed events with monotonic ids, the engine checksums and (optionally)
//! encrypts them on the way to disk, and on reopen replays the surviving
//! events in order to rebuild in-memory state. Two flag bits give in-place
//! rewrite and erase semantics, and the engine periodically compacts the
//! file by rewriting only the live event set and atomically swapping it in.
//!
//! ```no_run
//! use binlog::{Binlog, BinlogEvent, BinlogOptions, DbKey};
//!
//! # fn main() -> binlog::Result<()> {
//! let mut log = Binlog::open(
//!     "state.binlog",
//!     DbKey::password("hunter2"),
//!     DbKey::empty(),
//!     BinlogOptions::default(),
//!     |event| println!("replayed event {}", event.id()),
//! )?;
//! log.add_event(BinlogEvent::new(1, 7, 0, b"payload")?)?;
//! log.sync()?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod event;
pub mod events_buffer;
mod fsync;
pub mod processor;
pub mod reader;

pub use crypto::DbKey;
pub use engine::{Binlog, BinlogInfo, BinlogOptions};
pub use error::{BinlogError, Result};
pub use event::BinlogEvent;
pub use events_buffer::EventsBuffer;
pub use processor::EventsProcessor;
pub use reader::{BinlogReader, ReadNext};
