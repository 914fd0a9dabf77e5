//! Encryption stage
//!
//! Streams a cleartext file through the chunk cipher and stores the
//! ciphertext as parts of the upload job. Part boundaries are exact multiples
//! of the part size; only the last part may be shorter.

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tracing::debug;

use sealbox_common::CIPHER_FORMAT;

use super::cancel::CancelFlag;
use super::progress::ProgressReporter;
use super::read_up_to;
use crate::crypto::{self, CHUNK_SIZE, KeyProvider, StreamEncryptor};
use crate::db::{Database, EncryptionResult, UploadJob};
use crate::error::StageError;

/// Encrypt the job's source file into parts
///
/// Parts from an earlier, interrupted run are purged first. The job record is
/// not touched; the coordinator records the returned result.
pub async fn run_encryption(
    db: &Database,
    keys: &dyn KeyProvider,
    job: &UploadJob,
    cancel: &CancelFlag,
    progress: &mut ProgressReporter,
) -> Result<EncryptionResult, StageError> {
    let key = job.key();
    db.parts.delete_all(&key).await?;

    let secret = keys.upload_key(&job.user_id)?;
    let mut encryptor = StreamEncryptor::new(&secret);
    let mut file = File::open(&job.source_path).await?;

    let part_size = crypto::part_size_for(job.clear_size) as usize;
    let mut hasher = Sha256::new();
    let mut pending: Vec<u8> = Vec::with_capacity(part_size);
    let mut written: u64 = 0;
    let mut clear_read: u64 = 0;

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut current_len = read_up_to(&mut file, &mut current).await?;
    let mut next = vec![0u8; CHUNK_SIZE];

    loop {
        cancel.check()?;

        // A short read means end of file; otherwise peek at the following chunk
        let next_len = if current_len == CHUNK_SIZE {
            read_up_to(&mut file, &mut next).await?
        } else {
            0
        };
        let last = next_len == 0;

        let sealed = encryptor.seal_chunk(&current[..current_len], last)?;
        hasher.update(&sealed);
        pending.extend_from_slice(&sealed);
        clear_read += current_len as u64;

        while pending.len() >= part_size {
            let part: Vec<u8> = pending.drain(..part_size).collect();
            db.parts.put(&key, written, &part).await?;
            written += part.len() as u64;
        }

        progress.report(clear_read);

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    if !pending.is_empty() {
        db.parts.put(&key, written, &pending).await?;
        written += pending.len() as u64;
    }

    if clear_read != job.clear_size {
        return Err(StageError::Protocol(format!(
            "source changed size: expected {} bytes, read {clear_read}",
            job.clear_size
        )));
    }

    let content_id = hex::encode(hasher.finalize());
    debug!(job = %key, content_id = %content_id, size = written, "encryption finished");

    Ok(EncryptionResult {
        encrypted_size: written,
        content_id,
        format: CIPHER_FORMAT.to_string(),
        nonce: encryptor.header().to_hex(),
    })
}
