//! Download transfer stage
//!
//! Streams ciphertext from the filehost straight into a buffer file. The
//! buffer file's length is the resume position: bytes that reached the file
//! are never requested again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::cancel::CancelFlag;
use super::progress::ProgressReporter;
use crate::constants::CIPHERTEXT_SUFFIX;
use crate::db::{Database, DownloadJob};
use crate::error::StageError;
use crate::host::{FileHost, ResponseKind};

/// Bytes written between flushes of the buffer file and position updates
const PERSIST_EVERY: u64 = 1024 * 1024;

/// Buffer file holding the ciphertext of a download
pub fn buffer_path(downloads_dir: &Path, job: &DownloadJob) -> PathBuf {
    downloads_dir
        .join(&job.user_id)
        .join(format!("{}.{CIPHERTEXT_SUFFIX}", job.content_id))
}

async fn file_len(path: &Path) -> Result<u64, StageError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Download the remainder of a `downloading` job into `buffer`
///
/// Returns the final ciphertext length. On success the job is moved to
/// `encrypted`. On any failure the bytes already flushed stay in the buffer
/// file and the persisted position never exceeds them.
pub async fn run_download(
    db: &Database,
    host: &Arc<dyn FileHost>,
    job: &DownloadJob,
    buffer: &Path,
    cancel: &CancelFlag,
    progress: &mut ProgressReporter,
) -> Result<u64, StageError> {
    let url = job
        .stream_url()
        .ok_or_else(|| StageError::Protocol("no known location".to_string()))?;
    if let Some(parent) = buffer.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut position = file_len(buffer).await?;
    if let Some(size) = job.encrypted_size
        && position > size
    {
        warn!(job = %job.key(), position, size, "buffer longer than object, restarting");
        fs::File::create(buffer).await?;
        position = 0;
    }
    if position < job.position {
        // The buffer lost data the record still claims; trust the file
        db.downloads.reset_position(&job.content_id, &job.user_id).await?;
    }
    db.downloads
        .set_position(&job.content_id, &job.user_id, position)
        .await?;
    progress.force(position);

    if job.encrypted_size == Some(position) {
        debug!(job = %job.key(), position, "buffer already complete");
        return finish(db, job, position).await;
    }

    let response = cancel
        .guard(async { host.open_download(&url, position).await.map_err(StageError::from) })
        .await?;

    match response.kind {
        ResponseKind::Partial { start } if start != position => {
            return Err(StageError::Protocol(format!(
                "requested range from {position}, host answered from {start}"
            )));
        }
        ResponseKind::Partial { .. } => {}
        ResponseKind::Full if position > 0 => {
            debug!(job = %job.key(), position, "host ignored range, restarting from zero");
            fs::File::create(buffer).await?;
            db.downloads.reset_position(&job.content_id, &job.user_id).await?;
            position = 0;
            progress.restart(0);
        }
        ResponseKind::Full => {}
    }

    let expected = job.encrypted_size.or(response.total);
    if let Some(total) = expected {
        progress.set_total(total);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(buffer)
        .await?;
    let mut body = response.body;
    let mut unflushed: u64 = 0;

    let streamed: Result<(), StageError> = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(StageError::Cancelled),
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if let Err(e) = file.write_all(&chunk).await {
                    break Err(e.into());
                }
                position += chunk.len() as u64;
                unflushed += chunk.len() as u64;

                if unflushed >= PERSIST_EVERY {
                    if let Err(e) = persist(db, job, &mut file, position).await {
                        break Err(e);
                    }
                    unflushed = 0;
                }
                progress.report(position);
            }
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        }
    };

    // Whatever happened, make the bytes on disk and the record agree
    persist(db, job, &mut file, position).await?;
    file.sync_all().await?;
    streamed?;

    if let Some(total) = expected
        && position != total
    {
        return if position < total {
            Err(StageError::Transient(format!(
                "stream ended at {position} of {total} bytes"
            )))
        } else {
            Err(StageError::Protocol(format!(
                "received {position} bytes, expected {total}"
            )))
        };
    }

    progress.force(position);
    finish(db, job, position).await
}

async fn persist(
    db: &Database,
    job: &DownloadJob,
    file: &mut fs::File,
    position: u64,
) -> Result<(), StageError> {
    file.flush().await?;
    db.downloads
        .set_position(&job.content_id, &job.user_id, position)
        .await?;
    Ok(())
}

async fn finish(db: &Database, job: &DownloadJob, size: u64) -> Result<u64, StageError> {
    if !db
        .downloads
        .finish_download(&job.content_id, &job.user_id, size)
        .await?
    {
        return Err(StageError::Internal(format!(
            "{} left downloading during transfer",
            job.key()
        )));
    }
    Ok(size)
}
