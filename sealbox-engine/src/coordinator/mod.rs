//! Coordinators
//!
//! One coordinator task per direction. Each owns at most one active job per
//! stage (an `Option<ActiveJob>` slot), picks the next eligible job from the
//! store whenever a slot frees up or the maintenance interval elapses, and
//! turns stage results into job states and hub updates.
//!
//! A coordinator task selects over four sources: its command channel, stage
//! completions, stage progress and the maintenance ticker.

mod download;
mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sealbox_common::{Command, CoordinatorUpdate, Direction, JobKey};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::crypto::KeyProvider;
use crate::db::{Database, NewDownload, NewUpload};
use crate::error::{EngineError, Result};
use crate::host::FileHost;
use crate::hub::BroadcastHub;
use crate::transfers::{CancelFlag, CancelReason, DecryptStrategy};

pub(crate) use download::DownloadCoordinator;
pub(crate) use upload::UploadCoordinator;

/// Message recorded on jobs stopped by the user
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Message recorded when automatic retries are exhausted
pub const RETRY_LIMIT_MESSAGE: &str = "retry limit reached";

/// Dependencies injected into both coordinators
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub db: Database,
    pub host: Arc<dyn FileHost>,
    pub keys: Arc<dyn KeyProvider>,
    pub clock: Arc<dyn Clock>,
    pub hub: BroadcastHub,
    pub config: Arc<EngineConfig>,
    /// Lease owner id of this engine instance
    pub instance_id: String,
    pub downloads_dir: PathBuf,
    pub strategy: Arc<dyn DecryptStrategy>,
}

impl CoordinatorDeps {
    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Try to take (or extend) the lease of a job for this instance
    async fn acquire(&self, job: &JobKey) -> Result<bool> {
        self.acquire_named(&job.lease_name()).await
    }

    async fn release(&self, job: &JobKey) -> Result<()> {
        self.release_named(&job.lease_name()).await
    }

    /// Claim the add-file command of an upload for this instance's hub
    ///
    /// Held for as long as the command is outstanding, so actors attached to
    /// other instances never see it.
    async fn claim_command(&self, job_id: i64) -> Result<bool> {
        self.acquire_named(&command_lease_name(job_id)).await
    }

    async fn release_command(&self, job_id: i64) -> Result<()> {
        self.release_named(&command_lease_name(job_id)).await
    }

    async fn acquire_named(&self, name: &str) -> Result<bool> {
        self.db
            .leases
            .try_acquire(
                name,
                &self.instance_id,
                self.now(),
                self.config.lease_ttl_millis(),
            )
            .await
    }

    async fn release_named(&self, name: &str) -> Result<()> {
        self.db.leases.release(name, &self.instance_id).await?;
        Ok(())
    }

    async fn list_changed(&self, direction: Direction) {
        self.hub
            .publish(CoordinatorUpdate::list_changed(direction))
            .await;
    }
}

fn command_lease_name(job_id: i64) -> String {
    format!("command:{job_id}")
}

/// A job occupying a stage slot
pub(crate) struct ActiveJob {
    pub key: JobKey,
    pub cancel: CancelFlag,
    pub handle: JoinHandle<()>,
}

impl ActiveJob {
    fn is(&self, key: &JobKey) -> bool {
        &self.key == key
    }
}

/// Ask the job in `slot` to stop if it is `key`
///
/// Returns true if the job was active.
fn cancel_if_active(slot: &Option<ActiveJob>, key: &JobKey, reason: CancelReason) -> bool {
    match slot {
        Some(active) if active.is(key) => {
            active.cancel.cancel(reason);
            true
        }
        _ => false,
    }
}

// =============================================================================
// Handles
// =============================================================================

fn send(tx: &mpsc::UnboundedSender<Command>, command: Command) -> Result<()> {
    tx.send(command).map_err(|_| EngineError::Stopped)
}

/// Front door of the upload coordinator
///
/// New jobs are written to the store here, then announced to the task.
#[derive(Clone)]
pub struct UploadHandle {
    db: Database,
    clock: Arc<dyn Clock>,
    user_id: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl UploadHandle {
    /// Attach a cleartext file for encryption and upload
    pub async fn submit(&self, source: &Path, directory: &str) -> Result<JobKey> {
        let meta = tokio::fs::metadata(source).await?;
        if !meta.is_file() {
            return Err(EngineError::NotFound(source.display().to_string()));
        }
        let display_path = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let new = NewUpload {
            user_id: self.user_id.clone(),
            source_path: source.to_path_buf(),
            directory: directory.to_string(),
            display_path,
            clear_size: meta.len(),
        };
        let job = self.db.uploads.insert(&new, self.clock.now_millis()).await?;
        let key = job.key();
        send(&self.tx, Command::Enqueued { job: key.clone() })?;
        Ok(key)
    }

    pub fn pause(&self, id: i64) -> Result<()> {
        send(&self.tx, Command::Pause { job: JobKey::upload(id) })
    }

    pub fn resume(&self, id: i64) -> Result<()> {
        send(&self.tx, Command::Resume { job: JobKey::upload(id) })
    }

    pub fn cancel(&self, id: i64, delete: bool) -> Result<()> {
        send(
            &self.tx,
            Command::Cancel {
                job: JobKey::upload(id),
                delete,
            },
        )
    }

    /// The add-file command for `id` went through on `host_url`
    pub fn confirm_command(&self, id: i64, host_url: &str) -> Result<()> {
        send(
            &self.tx,
            Command::CommandSent {
                job_id: id,
                host_url: host_url.to_string(),
            },
        )
    }

    pub fn command_failed(&self, id: i64) -> Result<()> {
        send(&self.tx, Command::CommandFailed { job_id: id })
    }

    /// The object is known to be present on its filehost
    pub fn mark_verified(&self, content_id: &str) -> Result<()> {
        send(
            &self.tx,
            Command::Verified {
                content_id: content_id.to_string(),
            },
        )
    }

    pub fn wake(&self) -> Result<()> {
        send(&self.tx, Command::Wake)
    }

    pub fn shutdown(&self) -> Result<()> {
        send(&self.tx, Command::Shutdown)
    }
}

/// Front door of the download coordinator
#[derive(Clone)]
pub struct DownloadHandle {
    db: Database,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<Command>,
}

impl DownloadHandle {
    /// Queue a download
    ///
    /// Submitting a content id that already has a job only records the host
    /// as its most recent location.
    pub async fn submit(&self, new: &NewDownload) -> Result<JobKey> {
        let key = JobKey::download(&new.content_id, &new.user_id);
        self.db.downloads.insert(new, self.clock.now_millis()).await?;
        send(&self.tx, Command::Enqueued { job: key.clone() })?;
        Ok(key)
    }

    pub fn pause(&self, key: &JobKey) -> Result<()> {
        send(&self.tx, Command::Pause { job: key.clone() })
    }

    pub fn resume(&self, key: &JobKey) -> Result<()> {
        send(&self.tx, Command::Resume { job: key.clone() })
    }

    pub fn cancel(&self, key: &JobKey, delete: bool) -> Result<()> {
        send(
            &self.tx,
            Command::Cancel {
                job: key.clone(),
                delete,
            },
        )
    }

    pub fn wake(&self) -> Result<()> {
        send(&self.tx, Command::Wake)
    }

    pub fn shutdown(&self) -> Result<()> {
        send(&self.tx, Command::Shutdown)
    }
}

/// Spawn both coordinator tasks
pub(crate) fn spawn_coordinators(
    deps: CoordinatorDeps,
) -> (UploadHandle, DownloadHandle, Vec<JoinHandle<()>>) {
    let (upload_tx, upload_rx) = mpsc::unbounded_channel();
    let (download_tx, download_rx) = mpsc::unbounded_channel();

    let uploads = UploadHandle {
        db: deps.db.clone(),
        clock: Arc::clone(&deps.clock),
        user_id: deps.config.user_id.clone(),
        tx: upload_tx,
    };
    let downloads = DownloadHandle {
        db: deps.db.clone(),
        clock: Arc::clone(&deps.clock),
        tx: download_tx,
    };

    let upload = UploadCoordinator::new(deps.clone(), upload_rx);
    let download = DownloadCoordinator::new(deps, download_rx);
    let tasks = vec![tokio::spawn(upload.run()), tokio::spawn(download.run())];

    (uploads, downloads, tasks)
}
