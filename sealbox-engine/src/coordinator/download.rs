//! Download coordinator
//!
//! Runs the download stage and the decryption stage, one job each. A job is
//! only handed to decryption once its ciphertext is complete on disk, and the
//! decryption stage additionally holds the global decrypt lease so that at
//! most one decryption runs across all instances sharing the store.

use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use sealbox_common::{
    Command, ContentReady, CoordinatorUpdate, Direction, DownloadState, JobKey, Stage,
    TransferProgress,
};

use super::{
    ActiveJob, CANCELLED_MESSAGE, CoordinatorDeps, RETRY_LIMIT_MESSAGE, cancel_if_active,
};
use crate::constants::DECRYPT_LEASE;
use crate::db::DownloadJob;
use crate::error::{Result, StageError};
use crate::transfers::{
    CancelFlag, CancelReason, DecryptionContext, ProgressReporter, buffer_path, run_decryption,
    run_download,
};

type StageResult = std::result::Result<u64, StageError>;

enum StageDone {
    Download { key: JobKey, result: StageResult },
    Decryption { key: JobKey, result: StageResult },
}

pub(crate) struct DownloadCoordinator {
    deps: CoordinatorDeps,
    commands: mpsc::UnboundedReceiver<Command>,
    done_tx: mpsc::UnboundedSender<StageDone>,
    done_rx: mpsc::UnboundedReceiver<StageDone>,
    progress_tx: mpsc::UnboundedSender<TransferProgress>,
    progress_rx: mpsc::UnboundedReceiver<TransferProgress>,
    downloading: Option<ActiveJob>,
    decrypting: Option<ActiveJob>,
    /// Set when another instance held the decrypt lease; cleared every tick
    decrypt_busy: bool,
}

/// Split a download key into its parts
fn split_key(key: &JobKey) -> Option<(&str, &str)> {
    match key {
        JobKey::Download {
            content_id,
            user_id,
        } => Some((content_id, user_id)),
        JobKey::Upload { .. } => None,
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl DownloadCoordinator {
    pub(crate) fn new(deps: CoordinatorDeps, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            deps,
            commands,
            done_tx,
            done_rx,
            progress_tx,
            progress_rx,
            downloading: None,
            decrypting: None,
            decrypt_busy: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            user = %self.deps.config.user_id,
            strategy = self.deps.strategy.name(),
            "download coordinator started"
        );

        let mut ticker = interval(self.deps.config.maintenance_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(done) = self.done_rx.recv() => self.handle_done(done).await,
                Some(progress) = self.progress_rx.recv() => {
                    self.deps.hub.publish(CoordinatorUpdate::progress(progress)).await;
                    Ok(())
                }
                _ = ticker.tick() => self.maintenance().await,
            };
            if let Err(e) = result {
                warn!(error = %e, "download coordinator step failed");
            }
            if let Err(e) = self.schedule().await {
                warn!(error = %e, "download scheduling failed");
            }
        }

        self.shutdown().await;
        info!("download coordinator stopped");
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn schedule(&mut self) -> Result<()> {
        if self.downloading.is_none() {
            self.start_next_download().await?;
        }
        if self.decrypting.is_none() && !self.decrypt_busy {
            self.start_next_decryption().await?;
        }
        Ok(())
    }

    async fn start_next_download(&mut self) -> Result<()> {
        let candidates = self
            .deps
            .db
            .downloads
            .list_in_state(&self.deps.config.user_id, DownloadState::Initial)
            .await?;

        for job in candidates {
            let key = job.key();
            if !self.deps.acquire(&key).await? {
                continue;
            }
            if !self
                .deps
                .db
                .downloads
                .transition(
                    &job.content_id,
                    &job.user_id,
                    DownloadState::Initial,
                    DownloadState::Downloading,
                )
                .await?
            {
                self.deps.release(&key).await?;
                continue;
            }

            info!(job = %key, position = job.position, "downloading");
            self.downloading = Some(self.spawn_download(job));
            self.deps.list_changed(Direction::Download).await;
            return Ok(());
        }
        Ok(())
    }

    fn spawn_download(&self, job: DownloadJob) -> ActiveJob {
        let key = job.key();
        let cancel = CancelFlag::new();
        let deps = self.deps.clone();
        let done_tx = self.done_tx.clone();
        let buffer = buffer_path(&deps.downloads_dir, &job);
        let mut progress = ProgressReporter::new(
            self.progress_tx.clone(),
            Stage::Download,
            key.clone(),
            job.encrypted_size.unwrap_or(0),
            deps.config.progress_interval(),
        );

        let flag = cancel.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result =
                run_download(&deps.db, &deps.host, &job, &buffer, &flag, &mut progress).await;
            match &result {
                Ok(_) => progress.finish(job.content_id.clone()),
                Err(_) => progress.fail(),
            }
            let _ = done_tx.send(StageDone::Download {
                key: task_key,
                result,
            });
        });

        ActiveJob {
            key,
            cancel,
            handle,
        }
    }

    async fn start_next_decryption(&mut self) -> Result<()> {
        let Some(job) = self
            .deps
            .db
            .downloads
            .next_in_state(&self.deps.config.user_id, DownloadState::Encrypted)
            .await?
        else {
            return Ok(());
        };

        debug!(job = %job.key(), "scheduling decryption");
        self.decrypting = Some(self.spawn_decryption(job));
        Ok(())
    }

    fn spawn_decryption(&self, job: DownloadJob) -> ActiveJob {
        let key = job.key();
        let cancel = CancelFlag::new();
        let deps = self.deps.clone();
        let done_tx = self.done_tx.clone();
        let buffer = buffer_path(&deps.downloads_dir, &job);
        let mut progress = ProgressReporter::new(
            self.progress_tx.clone(),
            Stage::Decryption,
            key.clone(),
            job.encrypted_size.unwrap_or(0),
            deps.config.progress_interval(),
        );

        let flag = cancel.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let ctx = DecryptionContext {
                db: &deps.db,
                clock: deps.clock.as_ref(),
                strategy: deps.strategy.as_ref(),
                owner: &deps.instance_id,
                lease_ttl_millis: deps.config.lease_ttl_millis(),
            };
            let result = run_decryption(&ctx, &job, &buffer, &flag, &mut progress).await;
            match &result {
                Ok(_) => progress.finish(job.content_id.clone()),
                // Nothing ran
                Err(StageError::Busy | StageError::Skipped) => {}
                Err(_) => progress.fail(),
            }
            let _ = done_tx.send(StageDone::Decryption {
                key: task_key,
                result,
            });
        });

        ActiveJob {
            key,
            cancel,
            handle,
        }
    }

    // =========================================================================
    // Stage results
    // =========================================================================

    async fn handle_done(&mut self, done: StageDone) -> Result<()> {
        match done {
            StageDone::Download { key, result } => {
                let reason = take_slot(&mut self.downloading, &key);
                let settled = self.settle_download(&key, result, reason).await;
                self.deps.release(&key).await?;
                settled
            }
            StageDone::Decryption { key, result } => {
                let reason = take_slot(&mut self.decrypting, &key);
                self.settle_decryption(&key, result, reason).await
            }
        }
    }

    async fn settle_download(
        &mut self,
        key: &JobKey,
        result: StageResult,
        reason: Option<CancelReason>,
    ) -> Result<()> {
        let Some((content_id, user_id)) = split_key(key) else {
            return Ok(());
        };
        let downloads = &self.deps.db.downloads;

        match result {
            Ok(size) => {
                info!(job = %key, size, "download complete");
            }
            Err(StageError::Cancelled) => match reason {
                Some(CancelReason::Delete) => return self.delete_job(key).await,
                Some(CancelReason::Pause) => {
                    downloads
                        .transition(
                            content_id,
                            user_id,
                            DownloadState::Downloading,
                            DownloadState::Paused,
                        )
                        .await?;
                    info!(job = %key, "paused");
                }
                _ => {
                    downloads
                        .mark_error(
                            content_id,
                            user_id,
                            DownloadState::Downloading,
                            CANCELLED_MESSAGE,
                            false,
                        )
                        .await?;
                    info!(job = %key, "stopped");
                }
            },
            Err(e) => {
                let retryable = e.is_transient();
                warn!(job = %key, error = %e, retryable, "download failed");
                downloads
                    .mark_error(
                        content_id,
                        user_id,
                        DownloadState::Downloading,
                        &e.to_string(),
                        retryable,
                    )
                    .await?;
            }
        }
        self.deps.list_changed(Direction::Download).await;
        Ok(())
    }

    /// Record the outcome of a decryption
    ///
    /// Any failure, including a stop or pause, discards both the ciphertext
    /// and partial output and sends the job back to `paused` so that resuming
    /// downloads it again.
    async fn settle_decryption(
        &mut self,
        key: &JobKey,
        result: StageResult,
        reason: Option<CancelReason>,
    ) -> Result<()> {
        let Some((content_id, user_id)) = split_key(key) else {
            return Ok(());
        };
        let db = self.deps.db.clone();

        match result {
            Ok(len) => {
                let Some(job) = db.downloads.get(content_id, user_id).await? else {
                    return Ok(());
                };
                if !db.downloads.finish_decryption(content_id, user_id).await? {
                    return Ok(());
                }
                db.parts.delete_all(key).await?;
                info!(job = %key, len, output = %job.output_path.display(), "download finished");

                let mut update = CoordinatorUpdate::list_changed(Direction::Download);
                if job.auto_open {
                    update.ready.push(ContentReady {
                        content_id: job.content_id.clone(),
                        user_id: job.user_id.clone(),
                        output_path: job.output_path.display().to_string(),
                    });
                }
                self.deps.hub.publish(update).await;
                Ok(())
            }
            Err(StageError::Busy) => {
                debug!(job = %key, "decryption busy elsewhere, waiting");
                self.decrypt_busy = true;
                Ok(())
            }
            Err(StageError::Skipped) => {
                debug!(job = %key, "job left encrypted before decryption started");
                Ok(())
            }
            Err(StageError::Cancelled) if reason == Some(CancelReason::Delete) => {
                self.delete_job(key).await
            }
            Err(e) => {
                error!(job = %key, error = %e, "decryption failed, discarding ciphertext");
                let Some(job) = db.downloads.get(content_id, user_id).await? else {
                    return Ok(());
                };
                if db
                    .downloads
                    .demote_after_decryption_failure(content_id, user_id, &e.to_string())
                    .await?
                {
                    remove_if_exists(&buffer_path(&self.deps.downloads_dir, &job)).await?;
                    db.parts.delete_all(key).await?;
                }
                self.deps.list_changed(Direction::Download).await;
                Ok(())
            }
        }
    }

    async fn delete_job(&mut self, key: &JobKey) -> Result<()> {
        let Some((content_id, user_id)) = split_key(key) else {
            return Ok(());
        };
        let db = &self.deps.db;
        if let Some(job) = db.downloads.get(content_id, user_id).await? {
            remove_if_exists(&buffer_path(&self.deps.downloads_dir, &job)).await?;
        }
        db.parts.delete_all(key).await?;
        if db.downloads.delete(content_id, user_id).await? {
            info!(job = %key, "deleted");
        }
        self.deps.list_changed(Direction::Download).await;
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Enqueued { job } if split_key(&job).is_some() => {
                debug!(job = %job, "enqueued");
                self.deps.list_changed(Direction::Download).await;
            }
            Command::Pause { job } if split_key(&job).is_some() => self.pause(&job).await?,
            Command::Resume { job } if split_key(&job).is_some() => self.resume(&job).await?,
            Command::Cancel { job, delete } if split_key(&job).is_some() => {
                self.cancel(&job, delete).await?
            }
            Command::Wake => {}
            other => debug!(command = ?other, "ignoring command for another direction"),
        }
        Ok(())
    }

    async fn pause(&mut self, key: &JobKey) -> Result<()> {
        if cancel_if_active(&self.downloading, key, CancelReason::Pause)
            || cancel_if_active(&self.decrypting, key, CancelReason::Pause)
        {
            return Ok(());
        }
        let Some((content_id, user_id)) = split_key(key) else {
            return Ok(());
        };
        let downloads = &self.deps.db.downloads;
        let Some(job) = downloads.get(content_id, user_id).await? else {
            return Ok(());
        };
        if job.state.can_transition(DownloadState::Paused)
            && downloads
                .transition(content_id, user_id, job.state, DownloadState::Paused)
                .await?
        {
            info!(job = %key, "paused");
            self.deps.list_changed(Direction::Download).await;
        }
        Ok(())
    }

    async fn resume(&mut self, key: &JobKey) -> Result<()> {
        let Some((content_id, user_id)) = split_key(key) else {
            return Ok(());
        };
        let downloads = &self.deps.db.downloads;
        let Some(job) = downloads.get(content_id, user_id).await? else {
            return Ok(());
        };
        if !job.state.is_resumable() {
            debug!(job = %key, state = %job.state, "not resumable");
            return Ok(());
        }
        if downloads
            .resume(content_id, user_id, job.state, self.deps.now())
            .await?
        {
            info!(job = %key, "resumed");
            self.deps.list_changed(Direction::Download).await;
        }
        Ok(())
    }

    async fn cancel(&mut self, key: &JobKey, delete: bool) -> Result<()> {
        let reason = if delete {
            CancelReason::Delete
        } else {
            CancelReason::Stop
        };
        if cancel_if_active(&self.downloading, key, reason)
            || cancel_if_active(&self.decrypting, key, reason)
        {
            return Ok(());
        }
        if delete {
            return self.delete_job(key).await;
        }

        let Some((content_id, user_id)) = split_key(key) else {
            return Ok(());
        };
        let downloads = &self.deps.db.downloads;
        let Some(job) = downloads.get(content_id, user_id).await? else {
            return Ok(());
        };
        if !matches!(job.state, DownloadState::Done | DownloadState::Error)
            && downloads
                .mark_error(content_id, user_id, job.state, CANCELLED_MESSAGE, false)
                .await?
        {
            info!(job = %key, "stopped");
            self.deps.list_changed(Direction::Download).await;
        }
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Periodic housekeeping
    ///
    /// Renews leases, recovers downloads whose owner went away and requeues
    /// retryable failures until the retry cap is reached.
    async fn maintenance(&mut self) -> Result<()> {
        let db = self.deps.db.clone();
        let now = self.deps.now();
        let user = self.deps.config.user_id.clone();
        let mut changed = false;

        db.leases.purge_expired(now).await?;
        self.decrypt_busy = false;
        if let Some(active) = &self.downloading
            && !self.deps.acquire(&active.key).await?
        {
            warn!(job = %active.key, "lease lost to another instance");
        }
        if self.decrypting.is_some() {
            // Only extends a lease we already hold
            let holder = db.leases.holder(DECRYPT_LEASE, now).await?;
            if holder.as_deref() == Some(self.deps.instance_id.as_str()) {
                db.leases
                    .try_acquire(
                        DECRYPT_LEASE,
                        &self.deps.instance_id,
                        now,
                        self.deps.config.lease_ttl_millis(),
                    )
                    .await?;
            }
        }

        for job in db.downloads.list_in_state(&user, DownloadState::Downloading).await? {
            let key = job.key();
            let local = self
                .downloading
                .as_ref()
                .is_some_and(|active| active.key == key);
            if local || !self.deps.acquire(&key).await? {
                continue;
            }
            info!(job = %key, position = job.position, "recovering interrupted download");
            changed |= db
                .downloads
                .transition(
                    &job.content_id,
                    &job.user_id,
                    DownloadState::Downloading,
                    DownloadState::Initial,
                )
                .await?;
            self.deps.release(&key).await?;
        }

        let max_retries = self.deps.config.max_retries;
        for job in db.downloads.list_in_state(&user, DownloadState::Error).await? {
            if !job.retryable {
                continue;
            }
            if job.retries < max_retries {
                debug!(job = %job.key(), retries = job.retries, "retrying download");
                changed |= db.downloads.requeue(&job.content_id, &job.user_id, now).await?;
            } else {
                warn!(job = %job.key(), retries = job.retries, "download retry limit reached");
                changed |= db
                    .downloads
                    .mark_error(
                        &job.content_id,
                        &job.user_id,
                        DownloadState::Error,
                        RETRY_LIMIT_MESSAGE,
                        false,
                    )
                    .await?;
            }
        }

        if changed {
            self.deps.list_changed(Direction::Download).await;
        }
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop running stages
    ///
    /// A running decryption is awaited rather than aborted so that an
    /// in-place rewrite never leaves a half-decrypted buffer behind. The
    /// download stage is aborted and its job requeued.
    async fn shutdown(&mut self) {
        if let Some(active) = self.decrypting.take() {
            info!(job = %active.key, "waiting for decryption to finish");
            let _ = active.handle.await;
            while let Ok(done) = self.done_rx.try_recv() {
                if let StageDone::Decryption { key, result } = done
                    && let Err(e) = self.settle_decryption(&key, result, None).await
                {
                    warn!(job = %key, error = %e, "failed to settle decryption");
                }
            }
        }

        if let Some(active) = self.downloading.take() {
            active.handle.abort();
            let _ = active.handle.await;
            if let Some((content_id, user_id)) = split_key(&active.key)
                && let Err(e) = self
                    .deps
                    .db
                    .downloads
                    .transition(
                        content_id,
                        user_id,
                        DownloadState::Downloading,
                        DownloadState::Initial,
                    )
                    .await
            {
                warn!(job = %active.key, error = %e, "failed to reset download");
            }
        }

        if let Err(e) = self.deps.db.leases.release_all(&self.deps.instance_id).await {
            warn!(error = %e, "failed to release leases");
        }
    }
}

/// Empty a stage slot if it holds `key`, returning its cancel reason
fn take_slot(slot: &mut Option<ActiveJob>, key: &JobKey) -> Option<CancelReason> {
    match slot.take() {
        Some(active) if &active.key == key => active.cancel.reason(),
        other => {
            *slot = other;
            warn!(job = %key, "completion for a job not in its slot");
            None
        }
    }
}
