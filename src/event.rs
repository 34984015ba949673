//! Framed event records.
//!
//! Every record on disk is a self-delimiting little-endian frame:
//!
//! ```text
//! offset  size  field
//!      0     4  size   (total frame length, including this header and CRC)
//!      4     8  id
//!     12     4  type   (negative values are service records)
//!     16     4  flags
//!     20     8  extra  (unpadded payload length)
//!     28     n  payload, zero-padded to a multiple of 4
//! size-4     4  CRC32 of bytes [0, size-4)
//! ```
//!
//! `size` is always a multiple of 4 and bounded by [`MIN_EVENT_SIZE`] and
//! [`MAX_EVENT_SIZE`]. The raw frame is retained alongside the decoded view:
//! compaction re-emits the original bytes rather than re-encoding.

use std::fmt;

use crate::error::{BinlogError, Result};

/// Smallest legal frame: header plus CRC, empty payload.
pub const MIN_EVENT_SIZE: usize = 32;

/// Largest legal frame.
pub const MAX_EVENT_SIZE: usize = 1 << 24;

/// Byte length of the fixed header (everything before the payload).
pub const EVENT_HEADER_SIZE: usize = 28;

const EVENT_TAIL_SIZE: usize = 4;

/// Service record type: together with [`BinlogEvent::FLAG_REWRITE`], erases
/// the prior event with the same id.
pub const SERVICE_TYPE_EMPTY: i32 = -1;

/// Service record type: the encryption bootstrap record carrying salt, IV
/// and key-verification hash.
pub const SERVICE_TYPE_AES_CTR_ENCRYPTION: i32 = -2;

/// A single framed event.
///
/// Holds both the decoded header fields and the raw on-disk frame. The
/// payload is borrowed from the raw frame; nothing outlives it.
#[derive(Clone, PartialEq, Eq)]
pub struct BinlogEvent {
    id: u64,
    event_type: i32,
    flags: u32,
    payload_len: usize,
    offset: u64,
    raw: Vec<u8>,
}

impl BinlogEvent {
    /// This event supersedes any prior event with the same id.
    pub const FLAG_REWRITE: u32 = 1 << 0;

    /// This event is a fragment of a multi-record logical operation; it is
    /// applied atomically when the next non-partial event arrives.
    pub const FLAG_PARTIAL: u32 = 1 << 1;

    /// Builds a new event, encoding the frame.
    ///
    /// The payload is padded to 4-byte alignment inside the frame; its exact
    /// length is recorded in the header so decode round-trips it unchanged.
    ///
    /// # Errors
    ///
    /// Returns `TooBig` if the framed payload would exceed [`MAX_EVENT_SIZE`].
    pub fn new(id: u64, event_type: i32, flags: u32, payload: &[u8]) -> Result<Self> {
        let padded = payload.len().next_multiple_of(4);
        let size = MIN_EVENT_SIZE + padded;
        if size > MAX_EVENT_SIZE {
            return Err(BinlogError::TooBig { size });
        }

        let mut raw = Vec::with_capacity(size);
        raw.extend_from_slice(&(size as u32).to_le_bytes());
        raw.extend_from_slice(&id.to_le_bytes());
        raw.extend_from_slice(&event_type.to_le_bytes());
        raw.extend_from_slice(&flags.to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        raw.extend_from_slice(payload);
        raw.resize(EVENT_HEADER_SIZE + padded, 0);
        let crc = crc32fast::hash(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());

        Ok(BinlogEvent {
            id,
            event_type,
            flags,
            payload_len: payload.len(),
            offset: 0,
            raw,
        })
    }

    /// Decodes an event from a complete raw frame.
    ///
    /// Validates the size field against the frame length, the 4-byte
    /// alignment, the size bounds, the CRC trailer, and the payload length
    /// recorded in the header.
    pub fn from_raw(raw: Vec<u8>) -> Result<Self> {
        let len = raw.len();
        if len < MIN_EVENT_SIZE {
            return Err(BinlogError::TooSmall { size: len });
        }
        if len > MAX_EVENT_SIZE {
            return Err(BinlogError::TooBig { size: len });
        }
        if len % 4 != 0 {
            return Err(BinlogError::BadAlignment { size: len });
        }

        let size = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        if size != len {
            return Err(BinlogError::BadSize { size, len });
        }

        let stored = u32::from_le_bytes(raw[len - 4..].try_into().unwrap());
        let computed = crc32fast::hash(&raw[..len - EVENT_TAIL_SIZE]);
        if stored != computed {
            return Err(BinlogError::BadCrc { stored, computed });
        }

        let id = u64::from_le_bytes(raw[4..12].try_into().unwrap());
        let event_type = i32::from_le_bytes(raw[12..16].try_into().unwrap());
        let flags = u32::from_le_bytes(raw[16..20].try_into().unwrap());
        let payload_len = u64::from_le_bytes(raw[20..28].try_into().unwrap()) as usize;

        let capacity = len - MIN_EVENT_SIZE;
        if payload_len > capacity || capacity - payload_len >= 4 {
            return Err(BinlogError::BadSize {
                size: payload_len,
                len: capacity,
            });
        }

        Ok(BinlogEvent {
            id,
            event_type,
            flags,
            payload_len,
            offset: 0,
            raw,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> i32 {
        self.event_type
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// The payload bytes, without alignment padding.
    pub fn payload(&self) -> &[u8] {
        &self.raw[EVENT_HEADER_SIZE..EVENT_HEADER_SIZE + self.payload_len]
    }

    /// The complete on-disk frame, header and CRC included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Frame length in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// Byte offset just past this record in the file it was read from.
    /// Zero for events that have not been through the reader.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn is_rewrite(&self) -> bool {
        self.flags & Self::FLAG_REWRITE != 0
    }

    pub fn is_partial(&self) -> bool {
        self.flags & Self::FLAG_PARTIAL != 0
    }

    /// Service records carry a negative type and never enter the live set.
    pub fn is_service(&self) -> bool {
        self.event_type < 0
    }

    /// Clears the partial flag on the decoded view only. The raw frame keeps
    /// the flag, so replay after reopen reconstructs the same grouping.
    pub(crate) fn strip_partial(&mut self) {
        self.flags &= !Self::FLAG_PARTIAL;
    }
}

impl fmt::Debug for BinlogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinlogEvent")
            .field("id", &self.id)
            .field("type", &self.event_type)
            .field("flags", &self.flags)
            .field("size", &self.raw.len())
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ─── Basic encode/decode tests ───

    #[test]
    fn empty_payload_is_min_size() {
        let event = BinlogEvent::new(1, 7, 0, b"").unwrap();
        assert_eq!(event.size(), MIN_EVENT_SIZE);
        assert_eq!(event.payload(), b"");
    }

    #[test]
    fn unaligned_payload_is_padded() {
        let event = BinlogEvent::new(1, 7, 0, b"a").unwrap();
        assert_eq!(event.size(), MIN_EVENT_SIZE + 4);
        assert_eq!(event.payload(), b"a");
    }

    #[test]
    fn size_field_matches_frame_length() {
        let event = BinlogEvent::new(3, 9, 0, b"hello world").unwrap();
        let size = u32::from_le_bytes(event.raw()[0..4].try_into().unwrap());
        assert_eq!(size as usize, event.raw().len());
        assert_eq!(event.size() % 4, 0);
    }

    #[test]
    fn max_size_accepted_one_past_rejected() {
        let payload = vec![0u8; MAX_EVENT_SIZE - MIN_EVENT_SIZE];
        let event = BinlogEvent::new(1, 0, 0, &payload).unwrap();
        assert_eq!(event.size(), MAX_EVENT_SIZE);

        let payload = vec![0u8; MAX_EVENT_SIZE - MIN_EVENT_SIZE + 1];
        assert!(matches!(
            BinlogEvent::new(1, 0, 0, &payload),
            Err(BinlogError::TooBig { .. })
        ));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let event = BinlogEvent::new(1, 7, 0, b"data").unwrap();
        let mut raw = event.raw().to_vec();
        raw.truncate(raw.len() - 4);
        // Size field no longer matches the frame.
        assert!(matches!(
            BinlogEvent::from_raw(raw),
            Err(BinlogError::BadSize { .. })
        ));
    }

    #[test]
    fn decode_rejects_flipped_bit() {
        let event = BinlogEvent::new(1, 7, 0, b"data").unwrap();
        let mut raw = event.raw().to_vec();
        raw[EVENT_HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            BinlogEvent::from_raw(raw),
            Err(BinlogError::BadCrc { .. })
        ));
    }

    #[test]
    fn decode_rejects_short_frame() {
        assert!(matches!(
            BinlogEvent::from_raw(vec![0u8; 8]),
            Err(BinlogError::TooSmall { size: 8 })
        ));
    }

    #[test]
    fn decode_rejects_unaligned_frame() {
        let event = BinlogEvent::new(1, 7, 0, b"data").unwrap();
        let mut raw = event.raw().to_vec();
        raw.push(0);
        assert!(matches!(
            BinlogEvent::from_raw(raw),
            Err(BinlogError::BadAlignment { .. })
        ));
    }

    #[test]
    fn decode_rejects_inconsistent_payload_length() {
        let event = BinlogEvent::new(1, 7, 0, b"data").unwrap();
        let mut raw = event.raw().to_vec();
        // Claim a payload longer than the frame can hold, with a fixed CRC.
        raw[20..28].copy_from_slice(&(100u64).to_le_bytes());
        let crc = crc32fast::hash(&raw[..raw.len() - 4]);
        let len = raw.len();
        raw[len - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            BinlogEvent::from_raw(raw),
            Err(BinlogError::BadSize { .. })
        ));
    }

    #[test]
    fn flag_accessors() {
        let event = BinlogEvent::new(1, 7, BinlogEvent::FLAG_REWRITE, b"").unwrap();
        assert!(event.is_rewrite());
        assert!(!event.is_partial());

        let mut event = BinlogEvent::new(1, 7, BinlogEvent::FLAG_PARTIAL, b"").unwrap();
        assert!(event.is_partial());
        event.strip_partial();
        assert!(!event.is_partial());
        // The raw frame is untouched.
        let reparsed = BinlogEvent::from_raw(event.raw().to_vec()).unwrap();
        assert!(reparsed.is_partial());
    }

    #[test]
    fn service_types_are_negative() {
        let event = BinlogEvent::new(0, SERVICE_TYPE_EMPTY, 0, b"").unwrap();
        assert!(event.is_service());
        let event = BinlogEvent::new(5, 0, 0, b"").unwrap();
        assert!(!event.is_service());
    }

    // ─── Property tests ───

    proptest! {
        /// Encode/decode round-trips id, type, flags and payload exactly.
        #[test]
        fn roundtrip(
            id: u64,
            event_type: i32,
            flags: u32,
            payload in prop::collection::vec(prop::num::u8::ANY, 0..2048),
        ) {
            let event = BinlogEvent::new(id, event_type, flags, &payload).unwrap();
            let decoded = BinlogEvent::from_raw(event.raw().to_vec()).unwrap();
            prop_assert_eq!(decoded.id(), id);
            prop_assert_eq!(decoded.event_type(), event_type);
            prop_assert_eq!(decoded.flags(), flags);
            prop_assert_eq!(decoded.payload(), &payload[..]);
            prop_assert_eq!(decoded.size() % 4, 0);
        }

        /// Any single flipped bit is caught by the checksum or a header check.
        #[test]
        fn corruption_is_detected(
            payload in prop::collection::vec(prop::num::u8::ANY, 0..256),
            byte in 0usize..1000,
            bit in 0u8..8,
        ) {
            let event = BinlogEvent::new(42, 7, 0, &payload).unwrap();
            let mut raw = event.raw().to_vec();
            let byte = byte % raw.len();
            raw[byte] ^= 1 << bit;
            prop_assert!(BinlogEvent::from_raw(raw).is_err());
        }
    }
}
