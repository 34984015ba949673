//! In-memory live set of events.
//!
//! The processor is what the log *means*: the subset of appended events that
//! have not been superseded or erased, in id order. Because plain appends
//! must carry monotonically increasing ids, id order and first-insertion
//! order coincide, and a rewrite lands in the slot of the event it replaces.
//!
//! Replaying the live set in order reproduces the state that applying the
//! full event history would have produced.

use std::collections::BTreeMap;

use crate::error::{BinlogError, Result};
use crate::event::{BinlogEvent, SERVICE_TYPE_EMPTY};

/// Live set of events keyed by id.
#[derive(Debug, Default)]
pub struct EventsProcessor {
    events: BTreeMap<u64, BinlogEvent>,
    // Out-of-order ids parked during replay, keyed to the offset of the
    // first offending record. Emptied as rewrites cover them; anything left
    // at end of file fails the replay.
    deferred: BTreeMap<u64, u64>,
    last_id: u64,
    offset: u64,
    total_raw_events_size: u64,
}

impl EventsProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether [`EventsProcessor::add_event`] would accept the event,
    /// without mutating anything. The engine validates before the frame is
    /// committed to the write buffer, so a rejected append leaves no bytes
    /// behind.
    ///
    /// # Errors
    ///
    /// `NonMonotonicId` for a plain event with id zero, an id behind
    /// `last_id`, or an id equal to `last_id` whose entry has been erased.
    pub fn check_event(&self, event: &BinlogEvent) -> Result<()> {
        if event.is_rewrite() || event.is_service() {
            return Ok(());
        }
        if event.id() == self.last_id && self.events.contains_key(&event.id()) {
            return Ok(());
        }
        if event.id() == 0 || event.id() <= self.last_id {
            return Err(BinlogError::NonMonotonicId {
                id: event.id(),
                last_id: self.last_id,
            });
        }
        Ok(())
    }

    /// Applies one event to the live set.
    ///
    /// - A `Rewrite` event replaces the live event with the same id, or
    ///   erases it when its type is [`SERVICE_TYPE_EMPTY`]. Rewriting an id
    ///   with no live event inserts it; erasing one is a no-op.
    /// - Service events (negative type) never enter the live set.
    /// - A plain event must advance past `last_id`. The one exception is an
    ///   id equal to `last_id` with a live entry, which replaces that entry:
    ///   this is how the commit record of a partial batch supersedes its own
    ///   fragments.
    ///
    /// # Errors
    ///
    /// Whatever [`EventsProcessor::check_event`] reports.
    pub fn add_event(&mut self, event: BinlogEvent) -> Result<()> {
        self.check_event(&event)?;
        let offset = event.offset();
        let raw_len = event.size() as u64;

        if event.is_rewrite() {
            if let Some(old) = self.events.remove(&event.id()) {
                self.total_raw_events_size -= old.size() as u64;
                if event.event_type() == SERVICE_TYPE_EMPTY {
                    tracing::debug!(id = event.id(), "erased event");
                } else {
                    self.total_raw_events_size += raw_len;
                    self.events.insert(event.id(), event);
                }
            } else if event.event_type() == SERVICE_TYPE_EMPTY {
                tracing::debug!(id = event.id(), "erase for an id with no live event");
            } else {
                self.total_raw_events_size += raw_len;
                self.last_id = self.last_id.max(event.id());
                self.events.insert(event.id(), event);
            }
        } else if event.is_service() {
            // Bootstrap records and the like: applied by the engine, not
            // part of the live set.
        } else {
            // Either a fresh monotonic id or the same-id commit of a live
            // entry; a plain insert covers both.
            self.last_id = self.last_id.max(event.id());
            self.total_raw_events_size += raw_len;
            if let Some(old) = self.events.insert(event.id(), event) {
                self.total_raw_events_size -= old.size() as u64;
            }
        }

        self.offset = offset;
        Ok(())
    }

    /// Applies one event during file replay.
    ///
    /// Replay is more forgiving than a live append in exactly one way: a
    /// plain event whose id is out of order is parked instead of rejected,
    /// because a later rewrite of that id supersedes it and makes the
    /// history valid after all. [`EventsProcessor::finish_replay`] delivers
    /// the verdict on anything still parked when the file ends.
    pub fn replay_event(&mut self, event: BinlogEvent) -> Result<()> {
        if event.is_rewrite() && self.deferred.remove(&event.id()).is_some() {
            tracing::debug!(id = event.id(), "out-of-order event covered by rewrite");
        }
        if !event.is_rewrite() && !event.is_service() && self.check_event(&event).is_err() {
            // Parked, not applied: its payload is dead either way. Only a
            // covering rewrite can redeem the id.
            tracing::debug!(
                id = event.id(),
                last_id = self.last_id,
                "deferring out-of-order event until a rewrite covers it",
            );
            self.deferred.entry(event.id()).or_insert(event.offset());
            self.offset = event.offset();
            return Ok(());
        }
        self.add_event(event)
    }

    /// Verdict on events parked by [`EventsProcessor::replay_event`]: an id
    /// that no rewrite ever covered makes the replayed history invalid.
    ///
    /// # Errors
    ///
    /// `NonMonotonicId` naming the lowest uncovered id.
    pub fn finish_replay(&self) -> Result<()> {
        if let Some((&id, &offset)) = self.deferred.first_key_value() {
            tracing::error!(id, offset, "out-of-order event was never covered by a rewrite");
            return Err(BinlogError::NonMonotonicId {
                id,
                last_id: self.last_id,
            });
        }
        Ok(())
    }

    /// Visits live events in insertion order.
    pub fn for_each(&self, mut visitor: impl FnMut(&BinlogEvent)) {
        for event in self.events.values() {
            visitor(event);
        }
    }

    /// Iterates live events in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &BinlogEvent> {
        self.events.values()
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest id ever inserted.
    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// On-disk offset just past the last successfully applied record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Sum of raw frame sizes over the live set. Compared against the file
    /// size to decide when compaction pays off.
    pub fn total_raw_events_size(&self) -> u64 {
        self.total_raw_events_size
    }
}
