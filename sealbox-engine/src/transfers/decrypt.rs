//! Decryption stage
//!
//! Turns a completed download buffer into the cleartext output file. Two
//! strategies exist: rewriting the buffer in place, which needs a filesystem
//! that allows reading and writing one handle at different offsets and
//! truncating it, and copying into a new file. The strategy is chosen once
//! when the engine starts.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sealbox_common::{CIPHER_FORMAT, DownloadState};

use super::cancel::CancelFlag;
use super::progress::ProgressReporter;
use super::read_up_to;
use crate::clock::Clock;
use crate::config::DecryptMode;
use crate::constants::DECRYPT_LEASE;
use crate::crypto::{CryptoError, SEALED_CHUNK_SIZE, SecretKey, StreamDecryptor, StreamHeader};
use crate::db::{Database, DownloadJob};
use crate::error::StageError;

/// Suffix of a copy-strategy output file until it is complete
const PARTIAL_SUFFIX: &str = "part";

fn decryption_error(err: CryptoError) -> StageError {
    StageError::Decryption(err.to_string())
}

/// Way of turning ciphertext into cleartext on disk
#[async_trait]
pub trait DecryptStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decrypt `source` into `output`
    ///
    /// On success `source` no longer exists. Returns the cleartext length.
    async fn decrypt(
        &self,
        source: &Path,
        output: &Path,
        decryptor: StreamDecryptor,
        cancel: &CancelFlag,
        progress: &mut ProgressReporter,
    ) -> Result<u64, StageError>;
}

/// Rewrites the ciphertext file in place, then moves it to the output path
///
/// The write cursor trails the read cursor by one tag per chunk, so
/// cleartext never overwrites ciphertext that has not been read yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPlaceDecrypt;

#[async_trait]
impl DecryptStrategy for InPlaceDecrypt {
    fn name(&self) -> &'static str {
        "in-place"
    }

    async fn decrypt(
        &self,
        source: &Path,
        output: &Path,
        mut decryptor: StreamDecryptor,
        cancel: &CancelFlag,
        progress: &mut ProgressReporter,
    ) -> Result<u64, StageError> {
        let mut file = OpenOptions::new().read(true).write(true).open(source).await?;
        let total = file.metadata().await?.len();
        progress.set_total(total);

        let mut sealed = vec![0u8; SEALED_CHUNK_SIZE];
        let mut read_pos: u64 = 0;
        let mut write_pos: u64 = 0;

        loop {
            cancel.check()?;

            file.seek(SeekFrom::Start(read_pos)).await?;
            let len = read_up_to(&mut file, &mut sealed).await?;
            read_pos += len as u64;
            let last = read_pos >= total;

            let clear = decryptor
                .open_chunk(&sealed[..len], last)
                .map_err(decryption_error)?;

            if write_pos + clear.len() as u64 > read_pos {
                return Err(StageError::Internal(format!(
                    "write cursor {} passed read cursor {read_pos}",
                    write_pos + clear.len() as u64
                )));
            }
            file.seek(SeekFrom::Start(write_pos)).await?;
            file.write_all(&clear).await?;
            write_pos += clear.len() as u64;

            progress.report(read_pos);
            if last {
                break;
            }
        }

        file.set_len(write_pos).await?;
        file.sync_all().await?;
        drop(file);

        move_file(source, output).await?;
        Ok(write_pos)
    }
}

/// Writes cleartext to a new file and removes the ciphertext afterwards
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyDecrypt;

#[async_trait]
impl DecryptStrategy for CopyDecrypt {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn decrypt(
        &self,
        source: &Path,
        output: &Path,
        decryptor: StreamDecryptor,
        cancel: &CancelFlag,
        progress: &mut ProgressReporter,
    ) -> Result<u64, StageError> {
        let partial = partial_path(output);
        let result = copy_decrypt(source, &partial, decryptor, cancel, progress).await;

        match result {
            Ok(len) => {
                move_file(&partial, output).await?;
                fs::remove_file(source).await?;
                Ok(len)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

async fn copy_decrypt(
    source: &Path,
    target: &Path,
    mut decryptor: StreamDecryptor,
    cancel: &CancelFlag,
    progress: &mut ProgressReporter,
) -> Result<u64, StageError> {
    let mut input = File::open(source).await?;
    let total = input.metadata().await?.len();
    progress.set_total(total);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut out = File::create(target).await?;

    let mut sealed = vec![0u8; SEALED_CHUNK_SIZE];
    let mut read_pos: u64 = 0;
    let mut written: u64 = 0;

    loop {
        cancel.check()?;

        let len = read_up_to(&mut input, &mut sealed).await?;
        read_pos += len as u64;
        let last = read_pos >= total;

        let clear = decryptor
            .open_chunk(&sealed[..len], last)
            .map_err(decryption_error)?;
        out.write_all(&clear).await?;
        written += clear.len() as u64;

        progress.report(read_pos);
        if last {
            break;
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok(written)
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{PARTIAL_SUFFIX}"));
    output.with_file_name(name)
}

/// Rename, falling back to copy and delete across filesystems
async fn move_file(from: &Path, to: &Path) -> Result<(), StageError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::rename(from, to).await.is_err() {
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }
    Ok(())
}

/// Check whether `dir` supports in-place rewriting
///
/// Writes a scratch file, overwrites its start through a second seek and
/// truncates it.
pub async fn probe_in_place(dir: &Path) -> bool {
    let path = dir.join(format!(".probe-{}", Uuid::new_v4()));
    let result: std::io::Result<bool> = async {
        fs::create_dir_all(dir).await?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&[1u8; 64]).await?;
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&[2u8; 16]).await?;
        file.set_len(16).await?;
        file.sync_all().await?;
        Ok(file.metadata().await?.len() == 16)
    }
    .await;

    let _ = fs::remove_file(&path).await;
    matches!(result, Ok(true))
}

/// Resolve the configured mode to a strategy
pub async fn select_strategy(mode: DecryptMode, downloads_dir: &Path) -> Arc<dyn DecryptStrategy> {
    let strategy: Arc<dyn DecryptStrategy> = match mode {
        DecryptMode::InPlace => Arc::new(InPlaceDecrypt),
        DecryptMode::Copy => Arc::new(CopyDecrypt),
        DecryptMode::Auto => {
            if probe_in_place(downloads_dir).await {
                Arc::new(InPlaceDecrypt)
            } else {
                warn!(dir = %downloads_dir.display(), "in-place rewrite unsupported, decrypting by copy");
                Arc::new(CopyDecrypt)
            }
        }
    };
    info!(strategy = strategy.name(), "decryption strategy selected");
    strategy
}

/// Everything a decryption run needs besides the job
pub struct DecryptionContext<'a> {
    pub db: &'a Database,
    pub clock: &'a dyn Clock,
    pub strategy: &'a dyn DecryptStrategy,
    /// Lease owner, the id of this engine instance
    pub owner: &'a str,
    pub lease_ttl_millis: i64,
}

/// Decrypt an `encrypted` job's buffer into its output path
///
/// At most one decryption runs across all instances sharing the store: the
/// global decrypt lease is taken first, and [`StageError::Busy`] is returned if
/// another instance holds it. A job that is no longer `encrypted` once the
/// lease is held yields [`StageError::Skipped`]. The job record is not touched.
pub async fn run_decryption(
    ctx: &DecryptionContext<'_>,
    job: &DownloadJob,
    buffer: &Path,
    cancel: &CancelFlag,
    progress: &mut ProgressReporter,
) -> Result<u64, StageError> {
    if job.format != CIPHER_FORMAT {
        return Err(StageError::Decryption(format!(
            "unsupported format '{}'",
            job.format
        )));
    }
    let key = job
        .key
        .as_deref()
        .ok_or_else(|| StageError::Decryption("missing key".to_string()))?;
    let key = SecretKey::from_hex(key).map_err(decryption_error)?;
    let header = StreamHeader::from_hex(&job.nonce).map_err(decryption_error)?;

    let now = ctx.clock.now_millis();
    if !ctx
        .db
        .leases
        .try_acquire(DECRYPT_LEASE, ctx.owner, now, ctx.lease_ttl_millis)
        .await?
    {
        return Err(StageError::Busy);
    }

    // Finished elsewhere, paused or cancelled while we waited for the lease
    let current = ctx.db.downloads.get(&job.content_id, &job.user_id).await?;
    if current.map(|j| j.state) != Some(DownloadState::Encrypted) {
        ctx.db.leases.release(DECRYPT_LEASE, ctx.owner).await?;
        return Err(StageError::Skipped);
    }

    debug!(job = %job.key(), strategy = ctx.strategy.name(), "decrypting");
    let result = ctx
        .strategy
        .decrypt(
            buffer,
            &job.output_path,
            StreamDecryptor::new(&key, header),
            cancel,
            progress,
        )
        .await;

    ctx.db.leases.release(DECRYPT_LEASE, ctx.owner).await?;
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sealbox_common::{JobKey, Stage};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::crypto::{CHUNK_SIZE, seal_buffer};

    fn reporter() -> ProgressReporter {
        let (tx, _rx) = mpsc::unbounded_channel();
        ProgressReporter::new(tx, Stage::Decryption, JobKey::download("c", "u"), 0, Duration::ZERO)
    }

    fn sealed_file(dir: &Path, clear: &[u8]) -> (PathBuf, SecretKey, StreamHeader) {
        let key = SecretKey::random();
        let header = StreamHeader::random();
        let path = dir.join("object.enc");
        std::fs::write(&path, seal_buffer(&key, header, clear).unwrap()).unwrap();
        (path, key, header)
    }

    async fn check_strategy(strategy: &dyn DecryptStrategy) {
        for len in [0, 10, CHUNK_SIZE, 3 * CHUNK_SIZE + 77] {
            let dir = TempDir::new().unwrap();
            let clear: Vec<u8> = (0..len).map(|i| (i % 199) as u8).collect();
            let (source, key, header) = sealed_file(dir.path(), &clear);
            let output = dir.path().join("out").join("file.bin");

            let written = strategy
                .decrypt(
                    &source,
                    &output,
                    StreamDecryptor::new(&key, header),
                    &CancelFlag::new(),
                    &mut reporter(),
                )
                .await
                .unwrap();

            assert_eq!(written, len as u64);
            assert_eq!(std::fs::read(&output).unwrap(), clear, "{} len {len}", strategy.name());
            assert!(!source.exists());
        }
    }

    #[tokio::test]
    async fn test_in_place_round_trip() {
        check_strategy(&InPlaceDecrypt).await;
    }

    #[tokio::test]
    async fn test_copy_round_trip() {
        check_strategy(&CopyDecrypt).await;
    }

    #[tokio::test]
    async fn test_copy_failure_keeps_source_and_removes_partial() {
        let dir = TempDir::new().unwrap();
        let (source, _key, header) = sealed_file(dir.path(), b"hello world");
        let output = dir.path().join("file.bin");

        let result = CopyDecrypt
            .decrypt(
                &source,
                &output,
                StreamDecryptor::new(&SecretKey::random(), header),
                &CancelFlag::new(),
                &mut reporter(),
            )
            .await;

        assert!(matches!(result, Err(StageError::Decryption(_))));
        assert!(source.exists());
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[tokio::test]
    async fn test_truncated_ciphertext_fails() {
        let dir = TempDir::new().unwrap();
        let (source, key, header) = sealed_file(dir.path(), &vec![5u8; 2 * CHUNK_SIZE]);
        let len = std::fs::metadata(&source).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&source).unwrap();
        file.set_len(len - SEALED_CHUNK_SIZE as u64).unwrap();

        let result = InPlaceDecrypt
            .decrypt(
                &source,
                &dir.path().join("out.bin"),
                StreamDecryptor::new(&key, header),
                &CancelFlag::new(),
                &mut reporter(),
            )
            .await;
        assert!(matches!(result, Err(StageError::Decryption(_))));
    }

    #[tokio::test]
    async fn test_probe_on_tempdir() {
        let dir = TempDir::new().unwrap();
        assert!(probe_in_place(dir.path()).await);
        // The scratch file is cleaned up
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_modes() {
        let dir = TempDir::new().unwrap();
        assert_eq!(select_strategy(DecryptMode::Copy, dir.path()).await.name(), "copy");
        assert_eq!(select_strategy(DecryptMode::InPlace, dir.path()).await.name(), "in-place");
        assert_eq!(select_strategy(DecryptMode::Auto, dir.path()).await.name(), "in-place");
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/a/b/file.txt")),
            PathBuf::from("/a/b/file.txt.part")
        );
    }
}
