//! Upload transfer stage
//!
//! Sends the stored parts of a `ready` job in position order, starting from
//! the persisted position, then asks the filehost to verify the object.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use sealbox_common::UploadState;

use super::cancel::CancelFlag;
use super::progress::ProgressReporter;
use crate::db::{Database, UploadJob};
use crate::error::StageError;
use crate::host::{FileHost, HostError};

/// How an upload run ended
pub enum UploadOutcome {
    /// The filehost verified the object in time
    Verified,
    /// Verification is still running; the handle resolves when it finishes
    VerifyPending(JoinHandle<Result<(), HostError>>),
}

impl std::fmt::Debug for UploadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verified => f.write_str("Verified"),
            Self::VerifyPending(_) => f.write_str("VerifyPending"),
        }
    }
}

/// Target of an upload, read from the job record
struct Destination<'a> {
    host_url: &'a str,
    content_id: &'a str,
    encrypted_size: u64,
}

fn destination(job: &UploadJob) -> Result<Destination<'_>, StageError> {
    let missing = |field: &str| StageError::Protocol(format!("job has no {field}"));
    Ok(Destination {
        host_url: job.host_url.as_deref().ok_or_else(|| missing("host url"))?,
        content_id: job.content_id.as_deref().ok_or_else(|| missing("content id"))?,
        encrypted_size: job.encrypted_size.ok_or_else(|| missing("encrypted size"))?,
    })
}

/// Upload the remaining parts of an `uploading` job and finalize it
///
/// Every accepted part advances the persisted position before the next one is
/// sent, so a restart resumes exactly after the last acknowledged part. On
/// success the job is left in `verifying`; the coordinator completes it.
pub async fn run_upload(
    db: &Database,
    host: &Arc<dyn FileHost>,
    job: &UploadJob,
    cancel: &CancelFlag,
    progress: &mut ProgressReporter,
    verify_timeout: Duration,
) -> Result<UploadOutcome, StageError> {
    let key = job.key();
    let dest = destination(job)?;
    let mut position = job.position;
    progress.force(position);

    loop {
        cancel.check()?;

        let Some(part) = db.parts.next_from(&key, position).await? else {
            break;
        };
        if part.position != position {
            return Err(StageError::Protocol(format!(
                "missing part at {position}, next stored part starts at {}",
                part.position
            )));
        }

        let end = part.end();
        let data = Bytes::from(part.data);
        cancel
            .guard(async {
                host.put_part(dest.host_url, dest.content_id, position, data)
                    .await
                    .map_err(StageError::from)
            })
            .await?;

        position = end;
        db.uploads.set_position(job.id, position).await?;
        progress.report(position);
    }

    if position != dest.encrypted_size {
        return Err(StageError::Protocol(format!(
            "uploaded {position} bytes, expected {}",
            dest.encrypted_size
        )));
    }
    progress.force(position);

    if !db
        .uploads
        .transition(job.id, UploadState::Uploading, UploadState::Verifying)
        .await?
    {
        return Err(StageError::Internal(format!("{key} left uploading during transfer")));
    }
    debug!(job = %key, position, "all parts sent, finalizing");

    let mut finalize = spawn_finalize(host, dest.host_url, dest.content_id);
    match tokio::time::timeout(verify_timeout, &mut finalize).await {
        Ok(Ok(result)) => {
            result?;
            Ok(UploadOutcome::Verified)
        }
        Ok(Err(join)) => Err(StageError::Transient(format!("finalize task failed: {join}"))),
        Err(_) => {
            info!(job = %key, "verification still running, continuing in background");
            Ok(UploadOutcome::VerifyPending(finalize))
        }
    }
}

/// Ask the filehost to verify an object on a task of its own
pub fn spawn_finalize(
    host: &Arc<dyn FileHost>,
    host_url: &str,
    content_id: &str,
) -> JoinHandle<Result<(), HostError>> {
    let host = Arc::clone(host);
    let host_url = host_url.to_string();
    let content_id = content_id.to_string();
    tokio::spawn(async move { host.finalize(&host_url, &content_id).await })
}
