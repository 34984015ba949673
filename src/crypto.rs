//! Key material, key derivation, and the streaming AES-CTR transform.
//!
//! An encrypted binlog starts with a plaintext bootstrap record (the
//! [`KeyEvent`]) carrying a key-derivation salt, the CTR IV, and an
//! HMAC-SHA256 hash used to verify that the caller's password derives the
//! right key. Everything after that record is AES-256-CTR with the keystream
//! counter starting at zero; the running counter is carried across pipeline
//! rebuilds so the stream stays continuous.

use std::fmt;

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::{BinlogError, Result};

type HmacSha256 = Hmac<Sha256>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Derived AES key length.
pub const KEY_SIZE: usize = 32;

/// CTR IV length.
pub const IV_SIZE: usize = 16;

/// Key-verification hash length (HMAC-SHA256 output).
pub const HASH_SIZE: usize = 32;

/// Smallest salt accepted when parsing a bootstrap record.
pub const MIN_SALT_SIZE: usize = 16;

/// Salt length generated for fresh bootstrap records.
pub const DEFAULT_SALT_SIZE: usize = 32;

/// PBKDF2 iterations for password keys.
pub const KDF_ITERATION_COUNT: u32 = 60002;

/// PBKDF2 iterations for caller-declared raw keys, which already carry full
/// entropy and only need whitening.
pub const KDF_FAST_ITERATION_COUNT: u32 = 2;

const KEY_HASH_MESSAGE: &[u8] = b"cucumbers everywhere";

/// Password material for an encrypted binlog.
///
/// `Empty` means no encryption. `Password` goes through the slow PBKDF2
/// schedule; `RawKey` declares the bytes as already-random key material and
/// uses the fast schedule.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum DbKey {
    #[default]
    Empty,
    Password(String),
    RawKey(Vec<u8>),
}

impl DbKey {
    pub fn password(password: impl Into<String>) -> Self {
        DbKey::Password(password.into())
    }

    pub fn raw_key(key: impl Into<Vec<u8>>) -> Self {
        DbKey::RawKey(key.into())
    }

    pub fn empty() -> Self {
        DbKey::Empty
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DbKey::Empty)
    }

    pub fn is_raw_key(&self) -> bool {
        matches!(self, DbKey::RawKey(_))
    }

    pub(crate) fn data(&self) -> &[u8] {
        match self {
            DbKey::Empty => &[],
            DbKey::Password(p) => p.as_bytes(),
            DbKey::RawKey(k) => k,
        }
    }
}

impl fmt::Debug for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbKey::Empty => f.write_str("DbKey::Empty"),
            DbKey::Password(_) => f.write_str("DbKey::Password(..)"),
            DbKey::RawKey(_) => f.write_str("DbKey::RawKey(..)"),
        }
    }
}

/// Streaming AES-256-CTR transform with a big-endian 128-bit counter.
///
/// The cipher object carries the running keystream position; moving it
/// between the read and write paths is what keeps the on-disk stream
/// continuous across wiring changes.
pub(crate) struct AesCtrState {
    cipher: Aes256Ctr,
}

impl AesCtrState {
    pub(crate) fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        AesCtrState {
            cipher: Aes256Ctr::new(key.into(), iv.into()),
        }
    }

    /// Transforms bytes in place, advancing the counter. Encryption and
    /// decryption are the same operation.
    pub(crate) fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

impl fmt::Debug for AesCtrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesCtrState(..)")
    }
}

/// The encryption bootstrap record.
///
/// Serialized as a zero `u32` flags word followed by `key_salt`, `iv` and
/// `key_hash`, each a `u32` little-endian length prefix plus the bytes,
/// zero-padded to 4-byte alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyEvent {
    pub key_salt: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_hash: Vec<u8>,
}

impl KeyEvent {
    /// Builds a fresh bootstrap record: the given salt, a random IV, and the
    /// verification hash of `key`.
    pub(crate) fn generate(key_salt: Vec<u8>, key: &[u8; KEY_SIZE]) -> Self {
        let mut iv = vec![0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let key_hash = generate_key_hash(key).to_vec();
        KeyEvent {
            key_salt,
            iv,
            key_hash,
        }
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        for field in [&self.key_salt, &self.iv, &self.key_hash] {
            out.extend_from_slice(&(field.len() as u32).to_le_bytes());
            out.extend_from_slice(field);
            out.resize(out.len().next_multiple_of(4), 0);
        }
        out
    }

    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        let mut cursor = payload;
        let flags = take_u32(&mut cursor)?;
        if flags != 0 {
            return Err(BinlogError::BadKeyEvent {
                reason: "unknown flags",
            });
        }
        let key_salt = take_bytes(&mut cursor)?;
        let iv = take_bytes(&mut cursor)?;
        let key_hash = take_bytes(&mut cursor)?;

        if key_salt.len() < MIN_SALT_SIZE {
            return Err(BinlogError::BadKeyEvent {
                reason: "salt too short",
            });
        }
        if iv.len() != IV_SIZE {
            return Err(BinlogError::BadKeyEvent {
                reason: "bad iv length",
            });
        }
        if key_hash.len() != HASH_SIZE {
            return Err(BinlogError::BadKeyEvent {
                reason: "bad key hash length",
            });
        }

        Ok(KeyEvent {
            key_salt,
            iv,
            key_hash,
        })
    }

    /// Derives the AES key for `db_key` under this record's salt.
    pub(crate) fn generate_key(&self, db_key: &DbKey) -> [u8; KEY_SIZE] {
        derive_key(db_key, &self.key_salt)
    }

    /// Constant-time check of `key` against the stored verification hash.
    pub(crate) fn verify_key(&self, key: &[u8; KEY_SIZE]) -> bool {
        let mut mac =
            HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(KEY_HASH_MESSAGE);
        mac.verify_slice(&self.key_hash).is_ok()
    }
}

/// A fresh key-derivation salt of the default size.
pub(crate) fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; DEFAULT_SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// PBKDF2-HMAC-SHA256 over the password material. Raw keys use the fast
/// iteration schedule.
pub(crate) fn derive_key(db_key: &DbKey, salt: &[u8]) -> [u8; KEY_SIZE] {
    debug_assert!(!db_key.is_empty());
    let iterations = if db_key.is_raw_key() {
        KDF_FAST_ITERATION_COUNT
    } else {
        KDF_ITERATION_COUNT
    };
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(db_key.data(), salt, iterations, &mut key);
    key
}

/// HMAC-SHA256 verification hash of a derived key.
pub(crate) fn generate_key_hash(key: &[u8; KEY_SIZE]) -> [u8; HASH_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(KEY_HASH_MESSAGE);
    mac.finalize().into_bytes().into()
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(BinlogError::BadKeyEvent {
            reason: "truncated record",
        });
    }
    let value = u32::from_le_bytes(cursor[..4].try_into().unwrap());
    *cursor = &cursor[4..];
    Ok(value)
}

fn take_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    let len = take_u32(cursor)? as usize;
    let padded = len.next_multiple_of(4);
    if cursor.len() < padded {
        return Err(BinlogError::BadKeyEvent {
            reason: "truncated record",
        });
    }
    let bytes = cursor[..len].to_vec();
    *cursor = &cursor[padded..];
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ─── KeyEvent serialization ───

    #[test]
    fn serialize_parse_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let event = KeyEvent::generate(random_salt(), &key);
        let parsed = KeyEvent::parse(&event.serialize()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn generate_uses_default_salt_size() {
        let key = [0u8; KEY_SIZE];
        let event = KeyEvent::generate(random_salt(), &key);
        assert_eq!(event.key_salt.len(), DEFAULT_SALT_SIZE);
        assert_eq!(event.iv.len(), IV_SIZE);
        assert_eq!(event.key_hash.len(), HASH_SIZE);
    }

    #[test]
    fn generate_reuses_given_salt() {
        let key = [0u8; KEY_SIZE];
        let salt = vec![9u8; 16];
        let event = KeyEvent::generate(salt.clone(), &key);
        assert_eq!(event.key_salt, salt);
    }

    #[test]
    fn parse_rejects_short_salt() {
        let key = [0u8; KEY_SIZE];
        let mut event = KeyEvent::generate(random_salt(), &key);
        event.key_salt.truncate(8);
        assert!(matches!(
            KeyEvent::parse(&event.serialize()),
            Err(BinlogError::BadKeyEvent { .. })
        ));
    }

    #[test]
    fn parse_rejects_truncated_payload() {
        let key = [0u8; KEY_SIZE];
        let bytes = KeyEvent::generate(random_salt(), &key).serialize();
        for cut in [0, 3, 10, bytes.len() - 1] {
            assert!(
                KeyEvent::parse(&bytes[..cut]).is_err(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn parse_rejects_nonzero_flags() {
        let key = [0u8; KEY_SIZE];
        let mut bytes = KeyEvent::generate(random_salt(), &key).serialize();
        bytes[0] = 1;
        assert!(matches!(
            KeyEvent::parse(&bytes),
            Err(BinlogError::BadKeyEvent { .. })
        ));
    }

    // ─── Key derivation and verification ───

    #[test]
    fn derive_key_is_deterministic() {
        let db_key = DbKey::password("secret");
        let salt = [1u8; DEFAULT_SALT_SIZE];
        assert_eq!(derive_key(&db_key, &salt), derive_key(&db_key, &salt));
    }

    #[test]
    fn derive_key_depends_on_salt_and_password() {
        let db_key = DbKey::password("secret");
        let key_a = derive_key(&db_key, &[1u8; 16]);
        let key_b = derive_key(&db_key, &[2u8; 16]);
        assert_ne!(key_a, key_b);

        let other = DbKey::password("other");
        assert_ne!(derive_key(&db_key, &[1u8; 16]), derive_key(&other, &[1u8; 16]));
    }

    #[test]
    fn raw_key_uses_fast_schedule_and_differs_from_password() {
        // Same bytes, different declared kind, different derived key.
        let raw = DbKey::raw_key(b"0123456789abcdef0123456789abcdef".to_vec());
        let password = DbKey::password("0123456789abcdef0123456789abcdef");
        let salt = [3u8; 16];
        assert_ne!(derive_key(&raw, &salt), derive_key(&password, &salt));
    }

    #[test]
    fn verify_key_accepts_matching_key_only() {
        let db_key = DbKey::password("pw");
        let salt = vec![5u8; DEFAULT_SALT_SIZE];
        let key = derive_key(&db_key, &salt);
        let event = KeyEvent::generate(salt, &key);

        assert!(event.verify_key(&key));
        let wrong = derive_key(&DbKey::password("other"), &event.key_salt);
        assert!(!event.verify_key(&wrong));
    }

    #[test]
    fn debug_output_redacts_key_material() {
        let formatted = format!("{:?}", DbKey::password("hunter2"));
        assert!(!formatted.contains("hunter2"));
    }

    // ─── Stream cipher ───

    #[test]
    fn ctr_roundtrip() {
        let key = [11u8; KEY_SIZE];
        let iv = [22u8; IV_SIZE];
        let mut data = b"some plaintext bytes".to_vec();
        let original = data.clone();

        AesCtrState::new(&key, &iv).apply(&mut data);
        assert_ne!(data, original);
        AesCtrState::new(&key, &iv).apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn counter_continues_across_split_applications() {
        let key = [1u8; KEY_SIZE];
        let iv = [2u8; IV_SIZE];
        let plaintext = vec![0x5au8; 100];

        let mut whole = plaintext.clone();
        AesCtrState::new(&key, &iv).apply(&mut whole);

        let mut pieces = plaintext.clone();
        let mut state = AesCtrState::new(&key, &iv);
        // Deliberately uneven, non-block-aligned splits.
        let (a, rest) = pieces.split_at_mut(7);
        let (b, c) = rest.split_at_mut(41);
        state.apply(a);
        state.apply(b);
        state.apply(c);

        assert_eq!(pieces, whole);
    }

    proptest! {
        /// Keystream application is an involution for any key, iv and data.
        #[test]
        fn apply_twice_is_identity(
            key in prop::array::uniform32(prop::num::u8::ANY),
            data in prop::collection::vec(prop::num::u8::ANY, 0..512),
        ) {
            let iv = [0u8; IV_SIZE];
            let mut roundtripped = data.clone();
            AesCtrState::new(&key, &iv).apply(&mut roundtripped);
            AesCtrState::new(&key, &iv).apply(&mut roundtripped);
            prop_assert_eq!(roundtripped, data);
        }
    }
}
