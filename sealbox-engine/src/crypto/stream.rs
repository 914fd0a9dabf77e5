//! Sealing and opening of chunk streams

use chacha20poly1305::{
    Key, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, Payload},
};

use super::{CHUNK_SIZE, CryptoError, HEADER_LEN, SEALED_CHUNK_SIZE, SecretKey, StreamHeader, TAG_LEN};

/// Associated data marking a non-final chunk
const AD_MESSAGE: &[u8] = &[0];

/// Associated data marking the final chunk
const AD_FINAL: &[u8] = &[1];

/// Nonce for chunk `counter`: header followed by the big-endian counter
fn chunk_nonce(header: &StreamHeader, counter: u64) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..HEADER_LEN].copy_from_slice(header.as_bytes());
    nonce[HEADER_LEN..].copy_from_slice(&counter.to_be_bytes());
    *XNonce::from_slice(&nonce)
}

fn associated_data(last: bool) -> &'static [u8] {
    if last { AD_FINAL } else { AD_MESSAGE }
}

/// Seals cleartext chunks in order
pub struct StreamEncryptor {
    cipher: XChaCha20Poly1305,
    header: StreamHeader,
    counter: u64,
    finished: bool,
}

impl StreamEncryptor {
    /// Start a stream with a fresh random header
    pub fn new(key: &SecretKey) -> Self {
        Self::with_header(key, StreamHeader::random())
    }

    pub fn with_header(key: &SecretKey, header: StreamHeader) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            header,
            counter: 0,
            finished: false,
        }
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Seal the next chunk; `last` closes the stream
    pub fn seal_chunk(&mut self, chunk: &[u8], last: bool) -> Result<Vec<u8>, CryptoError> {
        if self.finished {
            return Err(CryptoError::StreamFinished);
        }
        if chunk.len() > CHUNK_SIZE {
            return Err(CryptoError::ChunkTooLarge(chunk.len()));
        }

        let nonce = chunk_nonce(&self.header, self.counter);
        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: chunk,
                    aad: associated_data(last),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        self.counter += 1;
        self.finished = last;
        Ok(sealed)
    }
}

/// Opens sealed chunks in order
pub struct StreamDecryptor {
    cipher: XChaCha20Poly1305,
    header: StreamHeader,
    counter: u64,
    finished: bool,
}

impl StreamDecryptor {
    pub fn new(key: &SecretKey, header: StreamHeader) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            header,
            counter: 0,
            finished: false,
        }
    }

    /// Open the next chunk; `last` must be true exactly for the final chunk
    pub fn open_chunk(&mut self, sealed: &[u8], last: bool) -> Result<Vec<u8>, CryptoError> {
        if self.finished {
            return Err(CryptoError::StreamFinished);
        }
        if sealed.len() < TAG_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        if sealed.len() > SEALED_CHUNK_SIZE {
            return Err(CryptoError::ChunkTooLarge(sealed.len()));
        }

        let nonce = chunk_nonce(&self.header, self.counter);
        let clear = self
            .cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: sealed,
                    aad: associated_data(last),
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        self.counter += 1;
        self.finished = last;
        Ok(clear)
    }

    /// Returns true once the final chunk has been opened
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Seal a whole buffer as one stream
pub fn seal_buffer(
    key: &SecretKey,
    header: StreamHeader,
    clear: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut encryptor = StreamEncryptor::with_header(key, header);
    let mut out = Vec::with_capacity(super::encrypted_size(clear.len() as u64) as usize);

    if clear.is_empty() {
        out.extend_from_slice(&encryptor.seal_chunk(&[], true)?);
        return Ok(out);
    }

    let mut chunks = clear.chunks(CHUNK_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        out.extend_from_slice(&encryptor.seal_chunk(chunk, last)?);
    }
    Ok(out)
}

/// Open a whole buffer sealed by [`seal_buffer`] or the encryption stage
pub fn open_buffer(
    key: &SecretKey,
    header: StreamHeader,
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut decryptor = StreamDecryptor::new(key, header);
    let mut out = Vec::with_capacity(sealed.len());

    if sealed.is_empty() {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut chunks = sealed.chunks(SEALED_CHUNK_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        out.extend_from_slice(&decryptor.open_chunk(chunk, last)?);
    }
    Ok(out)
}
