//! Chunked authenticated encryption for stored objects
//!
//! Objects are sealed with XChaCha20-Poly1305 in a STREAM construction: the
//! cleartext is cut into fixed-size chunks, each chunk is sealed under
//! `header || counter` and the final chunk is bound to an end-of-stream flag in
//! the associated data, so reordering and truncation both fail authentication.
//!
//! ```text
//! [chunk 0 ciphertext | tag][chunk 1 ciphertext | tag] ... [final chunk | tag]
//! ```
//!
//! The header (the object's nonce) and the key are kept outside the ciphertext,
//! on the job record.

mod key;
mod stream;

pub use key::{KeyProvider, SecretKey, StaticKeyProvider, StreamHeader};
pub use stream::{StreamDecryptor, StreamEncryptor, open_buffer, seal_buffer};

use thiserror::Error;

/// Cleartext bytes per sealed chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Poly1305 tag length appended to every chunk
pub const TAG_LEN: usize = 16;

/// Ciphertext bytes per full sealed chunk
pub const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_LEN;

/// Random per-object header length
pub const HEADER_LEN: usize = 16;

/// Key length in bytes
pub const KEY_LEN: usize = 32;

const MIB: u64 = 1024 * 1024;

/// Part size for files under 100 MiB
pub const MIN_PART_SIZE: u64 = MIB;

/// Upper bound on a single part
pub const MAX_PART_SIZE: u64 = 100 * MIB;

/// Files at or above this size use 1% of their size per part
const PROPORTIONAL_THRESHOLD: u64 = 100 * MIB;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Encryption failed (should not happen with valid input)
    #[error("encryption failed")]
    EncryptionFailed,
    /// Wrong key, corrupted data, truncated stream or tampered ciphertext
    #[error("decryption failed")]
    DecryptionFailed,
    /// A chunk was pushed after the final chunk
    #[error("stream already finished")]
    StreamFinished,
    /// A chunk exceeds the chunk size
    #[error("chunk of {0} bytes exceeds the chunk size")]
    ChunkTooLarge(usize),
    /// Key or header material is malformed
    #[error("invalid key material: {0}")]
    InvalidMaterial(String),
}

/// Ciphertext length produced for `clear_size` cleartext bytes
///
/// An empty input still produces one (empty) final chunk.
#[must_use]
pub fn encrypted_size(clear_size: u64) -> u64 {
    let chunks = clear_size.div_ceil(CHUNK_SIZE as u64).max(1);
    clear_size + chunks * TAG_LEN as u64
}

/// Cleartext length for a ciphertext length, if it is a valid stream length
#[must_use]
pub fn clear_size(encrypted: u64) -> Option<u64> {
    let chunks = encrypted.div_ceil(SEALED_CHUNK_SIZE as u64).max(1);
    let clear = encrypted.checked_sub(chunks * TAG_LEN as u64)?;
    (encrypted_size(clear) == encrypted).then_some(clear)
}

/// Part size used when splitting an object of `clear_size` bytes
///
/// 1 MiB below 100 MiB, then 1% of the file, never above 100 MiB.
#[must_use]
pub fn part_size_for(clear_size: u64) -> u64 {
    if clear_size < PROPORTIONAL_THRESHOLD {
        MIN_PART_SIZE
    } else {
        (clear_size / 100).clamp(MIN_PART_SIZE, MAX_PART_SIZE)
    }
}
