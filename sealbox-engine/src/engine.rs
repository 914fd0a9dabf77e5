//! Engine wiring
//!
//! An `Engine` is one instance of the transfer pipeline: its own coordinator
//! tasks and broadcast hub on top of a job store that other instances may
//! share.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use sealbox_common::{ContentReady, HubEvent, JobKey, PendingCommand};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorDeps, DownloadHandle, UploadHandle, spawn_coordinators};
use crate::crypto::{KeyProvider, StaticKeyProvider};
use crate::db::{Database, DownloadJob, NewDownload, UploadJob};
use crate::error::{EngineError, Result};
use crate::host::{FileHost, HttpFileHost};
use crate::hub::{BroadcastHub, HubListener, ListenerId};
use crate::transfers::select_strategy;

/// Everything needed to fetch and decrypt one object
#[derive(Clone)]
pub struct DownloadRequest {
    pub content_id: String,
    /// Filehost the object was last seen on
    pub host_url: String,
    pub encrypted_size: Option<u64>,
    pub format: String,
    /// Hex key
    pub key: String,
    /// Hex stream header
    pub nonce: String,
    /// Where the cleartext goes; defaults to the files directory
    pub output_path: Option<PathBuf>,
    /// File name used with the default output location
    pub file_name: Option<String>,
    pub auto_open: bool,
}

impl std::fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("content_id", &self.content_id)
            .field("host_url", &self.host_url)
            .field("encrypted_size", &self.encrypted_size)
            .field("format", &self.format)
            .field("key", &"[REDACTED]")
            .field("nonce", &self.nonce)
            .field("output_path", &self.output_path)
            .field("file_name", &self.file_name)
            .field("auto_open", &self.auto_open)
            .finish()
    }
}

/// One running transfer engine instance
pub struct Engine {
    config: Arc<EngineConfig>,
    db: Database,
    hub: BroadcastHub,
    uploads: UploadHandle,
    downloads: DownloadHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    instance_id: String,
}

impl Engine {
    /// Start an engine with the production filehost client and key provider
    ///
    /// Fails if the configuration carries no key.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let key = config
            .secret_key()?
            .ok_or_else(|| EngineError::Config("no key configured".to_string()))?;
        let db = Database::open(&config.database_path()?).await?;
        let host = HttpFileHost::new(config.request_timeout())
            .map_err(|e| EngineError::Config(format!("filehost client: {e}")))?;

        Self::start(
            config,
            db,
            Arc::new(host),
            Arc::new(StaticKeyProvider::new(key)),
            Arc::new(SystemClock),
        )
        .await
    }

    /// Start an engine from explicit dependencies
    pub async fn start(
        config: EngineConfig,
        db: Database,
        host: Arc<dyn FileHost>,
        keys: Arc<dyn KeyProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let downloads_dir = config.downloads_dir()?;
        tokio::fs::create_dir_all(&downloads_dir).await?;
        let strategy = select_strategy(config.decrypt_mode, &downloads_dir).await;

        let hub = BroadcastHub::new(config.listener_timeout());
        let instance_id = Uuid::new_v4().to_string();

        let deps = CoordinatorDeps {
            db: db.clone(),
            host,
            keys,
            clock,
            hub: hub.clone(),
            config: Arc::clone(&config),
            instance_id: instance_id.clone(),
            downloads_dir,
            strategy,
        };
        let (uploads, downloads, tasks) = spawn_coordinators(deps);
        info!(instance = %instance_id, user = %config.user_id, "engine started");

        Ok(Self {
            config,
            db,
            hub,
            uploads,
            downloads,
            tasks: Mutex::new(tasks),
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Submission and control
    // =========================================================================

    /// Attach a file for upload into `directory`
    pub async fn submit_upload(&self, path: &Path, directory: &str) -> Result<JobKey> {
        self.uploads.submit(path, directory).await
    }

    /// Queue a download for this instance's user
    pub async fn submit_download(&self, request: DownloadRequest) -> Result<JobKey> {
        let output_path = match request.output_path {
            Some(path) => path,
            None => {
                let name = request
                    .file_name
                    .unwrap_or_else(|| request.content_id.clone());
                self.config
                    .files_dir()?
                    .join(&self.config.user_id)
                    .join(name)
            }
        };
        let new = NewDownload {
            content_id: request.content_id,
            user_id: self.config.user_id.clone(),
            host_url: request.host_url,
            encrypted_size: request.encrypted_size,
            format: request.format,
            key: request.key,
            nonce: request.nonce,
            output_path,
            auto_open: request.auto_open,
        };
        self.downloads.submit(&new).await
    }

    pub fn cancel(&self, job: &JobKey, delete: bool) -> Result<()> {
        match job {
            JobKey::Upload { id } => self.uploads.cancel(*id, delete),
            JobKey::Download { .. } => self.downloads.cancel(job, delete),
        }
    }

    pub fn pause(&self, job: &JobKey) -> Result<()> {
        match job {
            JobKey::Upload { id } => self.uploads.pause(*id),
            JobKey::Download { .. } => self.downloads.pause(job),
        }
    }

    pub fn resume(&self, job: &JobKey) -> Result<()> {
        match job {
            JobKey::Upload { id } => self.uploads.resume(*id),
            JobKey::Download { .. } => self.downloads.resume(job),
        }
    }

    /// Run job selection on both coordinators now
    pub fn wake(&self) -> Result<()> {
        self.uploads.wake()?;
        self.downloads.wake()
    }

    // =========================================================================
    // Add-file command actor
    // =========================================================================

    /// Take the uploads waiting for an add-file command
    ///
    /// Each pending command is handed out once until it is confirmed or
    /// reported as failed.
    pub fn consume_commands(&self) -> Vec<PendingCommand> {
        self.hub.consume_commands()
    }

    pub fn confirm_command(&self, job_id: i64, host_url: &str) -> Result<()> {
        self.uploads.confirm_command(job_id, host_url)
    }

    pub fn command_failed(&self, job_id: i64) -> Result<()> {
        self.uploads.command_failed(job_id)
    }

    pub fn mark_verified(&self, content_id: &str) -> Result<()> {
        self.uploads.mark_verified(content_id)
    }

    /// Take finished downloads flagged for automatic opening
    pub fn consume_ready(&self) -> Vec<ContentReady> {
        self.hub.consume_ready()
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn subscribe(&self) -> (ListenerId, mpsc::Receiver<HubEvent>) {
        self.hub.subscribe()
    }

    pub fn register(&self, listener: Arc<dyn HubListener>) -> ListenerId {
        self.hub.register(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.hub.unregister(id)
    }

    pub async fn uploads(&self) -> Result<Vec<UploadJob>> {
        self.db.uploads.list(&self.config.user_id).await
    }

    pub async fn downloads(&self) -> Result<Vec<DownloadJob>> {
        self.db.downloads.list(&self.config.user_id).await
    }

    pub async fn upload(&self, id: i64) -> Result<Option<UploadJob>> {
        self.db.uploads.get(id).await
    }

    pub async fn download(&self, content_id: &str) -> Result<Option<DownloadJob>> {
        self.db
            .downloads
            .get(content_id, &self.config.user_id)
            .await
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop both coordinators and wait for them
    ///
    /// Running stages are interrupted and their jobs left restartable.
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        let _ = self.uploads.shutdown();
        let _ = self.downloads.shutdown();

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "coordinator task failed");
            }
        }
        info!(instance = %self.instance_id, "engine stopped");
    }
}
