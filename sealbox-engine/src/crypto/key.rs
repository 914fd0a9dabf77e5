//! Key and header material

use std::fmt;

use chacha20poly1305::aead::{OsRng, rand_core::RngCore};

use super::{CryptoError, HEADER_LEN, KEY_LEN};

/// 256-bit symmetric key
///
/// `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a key from the operating system RNG
    pub fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        parse_hex_array(s).map(Self)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Per-object random header, the nonce prefix of every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader([u8; HEADER_LEN]);

impl StreamHeader {
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut header = [0u8; HEADER_LEN];
        OsRng.fill_bytes(&mut header);
        Self(header)
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        parse_hex_array(s).map(Self)
    }
}

fn parse_hex_array<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidMaterial(e.to_string()))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        CryptoError::InvalidMaterial(format!("expected {N} bytes, got {}", bytes.len()))
    })
}

/// Source of the collection key used to encrypt a user's uploads
///
/// Key distribution is handled elsewhere; the engine only asks for the key when
/// it starts encrypting a job.
pub trait KeyProvider: Send + Sync {
    fn upload_key(&self, user_id: &str) -> Result<SecretKey, CryptoError>;
}

/// Provider returning one fixed key for every user
#[derive(Clone)]
pub struct StaticKeyProvider {
    key: SecretKey,
}

impl StaticKeyProvider {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn upload_key(&self, _user_id: &str) -> Result<SecretKey, CryptoError> {
        Ok(self.key.clone())
    }
}
