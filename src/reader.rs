//! Pull parser for framed events.
//!
//! `BinlogReader` consumes whole records from a [`ChainBuffer`], alternating
//! between two states: reading the 4-byte size prefix (peeked, never
//! consumed early) and reading the full record once enough bytes are
//! buffered. It never consumes a partial record, so a torn tail leaves the
//! buffer positioned exactly at the start of the bad record.

use crate::chain::ChainBuffer;
use crate::error::{BinlogError, Result};
use crate::event::{BinlogEvent, MAX_EVENT_SIZE, MIN_EVENT_SIZE};

/// Outcome of a [`BinlogReader::read_next`] call.
#[derive(Debug)]
pub enum ReadNext {
    /// A complete record was consumed and decoded.
    Event(BinlogEvent),
    /// At least this many bytes must be buffered to make progress.
    NeedBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadState {
    ReadLength,
    ReadEvent,
}

/// Two-state pull parser over a byte stream.
#[derive(Debug)]
pub struct BinlogReader {
    state: ReadState,
    size: usize,
    offset: u64,
}

impl Default for BinlogReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BinlogReader {
    pub fn new() -> Self {
        BinlogReader {
            state: ReadState::ReadLength,
            size: 0,
            offset: 0,
        }
    }

    /// Byte offset just past the last record produced.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Attempts to parse the next record out of `input`.
    ///
    /// Returns [`ReadNext::NeedBytes`] when the buffer holds less than a
    /// full record; the caller feeds more bytes and retries. Size-bound
    /// violations are reported before any bytes are consumed, so the offset
    /// still points at the start of the offending record.
    pub fn read_next(&mut self, input: &mut ChainBuffer) -> Result<ReadNext> {
        if self.state == ReadState::ReadLength {
            let mut len_buf = [0u8; 4];
            if !input.peek(&mut len_buf) {
                return Ok(ReadNext::NeedBytes(4));
            }
            let size = u32::from_le_bytes(len_buf) as usize;
            if size > MAX_EVENT_SIZE {
                return Err(BinlogError::TooBig { size });
            }
            if size < MIN_EVENT_SIZE {
                return Err(BinlogError::TooSmall { size });
            }
            self.size = size;
            self.state = ReadState::ReadEvent;
        }

        if input.len() < self.size {
            return Ok(ReadNext::NeedBytes(self.size));
        }

        let raw = input.take(self.size);
        let mut event = BinlogEvent::from_raw(raw)?;
        self.offset += self.size as u64;
        event.set_offset(self.offset);
        self.state = ReadState::ReadLength;
        Ok(ReadNext::Event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed_all(reader: &mut BinlogReader, input: &mut ChainBuffer) -> Vec<BinlogEvent> {
        let mut events = Vec::new();
        loop {
            match reader.read_next(input) {
                Ok(ReadNext::Event(event)) => events.push(event),
                Ok(ReadNext::NeedBytes(_)) => break,
                Err(e) => panic!("unexpected parse error: {e}"),
            }
        }
        events
    }

    #[test]
    fn empty_input_needs_four_bytes() {
        let mut reader = BinlogReader::new();
        let mut input = ChainBuffer::new();
        assert!(matches!(
            reader.read_next(&mut input).unwrap(),
            ReadNext::NeedBytes(4)
        ));
    }

    #[test]
    fn partial_record_requests_full_size() {
        let event = BinlogEvent::new(1, 7, 0, b"payload!").unwrap();
        let mut reader = BinlogReader::new();
        let mut input = ChainBuffer::new();
        input.append(&event.raw()[..10]);
        match reader.read_next(&mut input).unwrap() {
            ReadNext::NeedBytes(n) => assert_eq!(n, event.size()),
            other => panic!("expected NeedBytes, got {other:?}"),
        }
        // Nothing consumed while waiting.
        assert_eq!(input.len(), 10);
    }

    #[test]
    fn assigns_running_offsets() {
        let a = BinlogEvent::new(1, 7, 0, b"a").unwrap();
        let b = BinlogEvent::new(2, 7, 0, b"bb").unwrap();
        let mut reader = BinlogReader::new();
        let mut input = ChainBuffer::new();
        input.append(a.raw());
        input.append(b.raw());

        let events = feed_all(&mut reader, &mut input);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].offset(), a.size() as u64);
        assert_eq!(events[1].offset(), (a.size() + b.size()) as u64);
        assert_eq!(reader.offset(), (a.size() + b.size()) as u64);
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut reader = BinlogReader::new();
        let mut input = ChainBuffer::new();
        input.append(&((MAX_EVENT_SIZE as u32) + 1).to_le_bytes());
        assert!(matches!(
            reader.read_next(&mut input),
            Err(BinlogError::TooBig { .. })
        ));
    }

    #[test]
    fn rejects_undersized_length_prefix() {
        let mut reader = BinlogReader::new();
        let mut input = ChainBuffer::new();
        input.append(&8u32.to_le_bytes());
        assert!(matches!(
            reader.read_next(&mut input),
            Err(BinlogError::TooSmall { size: 8 })
        ));
    }

    proptest! {
        /// Records are recovered intact no matter how the byte stream is
        /// chopped up on the way in.
        #[test]
        fn chunked_feed_recovers_all_records(
            payloads in prop::collection::vec(
                prop::collection::vec(prop::num::u8::ANY, 0..64),
                1..10,
            ),
            chunk_size in 1usize..50,
        ) {
            let mut stream = Vec::new();
            let mut expected = Vec::new();
            for (i, payload) in payloads.iter().enumerate() {
                let event = BinlogEvent::new(i as u64 + 1, 7, 0, payload).unwrap();
                stream.extend_from_slice(event.raw());
                expected.push(payload.clone());
            }

            let mut reader = BinlogReader::new();
            let mut input = ChainBuffer::new();
            let mut events = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                input.append(chunk);
                events.extend(feed_all(&mut reader, &mut input));
            }

            prop_assert_eq!(events.len(), expected.len());
            for (event, payload) in events.iter().zip(&expected) {
                prop_assert_eq!(event.payload(), &payload[..]);
            }
            prop_assert_eq!(reader.offset(), stream.len() as u64);
            prop_assert!(input.is_empty());
        }
    }
}
