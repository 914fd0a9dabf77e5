//! Upload coordinator
//!
//! Runs the encryption stage and the upload stage, one job each. Encryption
//! draws from a FIFO of `initial` jobs; upload takes the oldest `ready` job.
//! Jobs that finish encryption wait in `send_command` until an external actor
//! reports that the add-file command went through.

use std::collections::{HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use sealbox_common::{
    Command, CoordinatorUpdate, Direction, JobKey, Stage, TransferProgress, UploadState,
};

use super::{
    ActiveJob, CANCELLED_MESSAGE, CoordinatorDeps, RETRY_LIMIT_MESSAGE, cancel_if_active,
};
use crate::db::{EncryptionResult, UploadJob};
use crate::error::{Result, StageError};
use crate::host::HostError;
use crate::transfers::{
    CancelFlag, CancelReason, ProgressReporter, UploadOutcome, run_encryption, run_upload,
    spawn_finalize,
};

/// Completion message from a stage task
enum StageDone {
    Encryption {
        id: i64,
        result: std::result::Result<EncryptionResult, StageError>,
    },
    Upload {
        id: i64,
        result: std::result::Result<UploadOutcome, StageError>,
    },
    /// A verification that outlived the upload stage finished
    Verification {
        id: i64,
        result: std::result::Result<(), HostError>,
    },
}

pub(crate) struct UploadCoordinator {
    deps: CoordinatorDeps,
    commands: mpsc::UnboundedReceiver<Command>,
    done_tx: mpsc::UnboundedSender<StageDone>,
    done_rx: mpsc::UnboundedReceiver<StageDone>,
    progress_tx: mpsc::UnboundedSender<TransferProgress>,
    progress_rx: mpsc::UnboundedReceiver<TransferProgress>,
    encrypting: Option<ActiveJob>,
    uploading: Option<ActiveJob>,
    /// Jobs waiting for the encryption stage, oldest first
    encrypt_queue: VecDeque<i64>,
    /// Jobs with a background verification in flight
    verifying: HashSet<i64>,
}

impl UploadCoordinator {
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
            encrypting: None,
            uploading: None,
            encrypt_queue: VecDeque::new(),
            verifying: HashSet::new(),
        }
    }

    fn user_id(&self) -> &str {
        &self.deps.config.user_id
    }

    pub(crate) async fn run(mut self) {
        info!(user = %self.user_id(), "upload coordinator started");

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
                warn!(error = %e, "upload coordinator step failed");
            }
            if let Err(e) = self.schedule().await {
                warn!(error = %e, "upload scheduling failed");
            }
        }

        self.shutdown().await;
        info!("upload coordinator stopped");
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn schedule(&mut self) -> Result<()> {
        if self.encrypting.is_none() {
            self.start_next_encryption().await?;
        }
        if self.uploading.is_none() {
            self.start_next_upload().await?;
        }
        Ok(())
    }

    async fn start_next_encryption(&mut self) -> Result<()> {
        while let Some(id) = self.encrypt_queue.pop_front() {
            let Some(job) = self.deps.db.uploads.get(id).await? else {
                continue;
            };
            if job.state != UploadState::Initial {
                continue;
            }
            let key = job.key();
            if !self.deps.acquire(&key).await? {
                debug!(job = %key, "held by another instance");
                continue;
            }
            if !self
                .deps
                .db
                .uploads
                .transition(id, UploadState::Initial, UploadState::Encrypting)
                .await?
            {
                self.deps.release(&key).await?;
                continue;
            }

            info!(job = %key, path = %job.source_path.display(), "encrypting");
            self.encrypting = Some(self.spawn_encryption(job));
            self.deps.list_changed(Direction::Upload).await;
            return Ok(());
        }
        Ok(())
    }

    fn spawn_encryption(&self, job: UploadJob) -> ActiveJob {
        let key = job.key();
        let cancel = CancelFlag::new();
        let deps = self.deps.clone();
        let done_tx = self.done_tx.clone();
        let mut progress = ProgressReporter::new(
            self.progress_tx.clone(),
            Stage::Encryption,
            key.clone(),
            job.clear_size,
            deps.config.progress_interval(),
        );

        let flag = cancel.clone();
        let handle = tokio::spawn(async move {
            let result =
                run_encryption(&deps.db, deps.keys.as_ref(), &job, &flag, &mut progress).await;
            match &result {
                Ok(r) => progress.finish(r.content_id.clone()),
                Err(_) => progress.fail(),
            }
            let _ = done_tx.send(StageDone::Encryption { id: job.id, result });
        });

        ActiveJob {
            key,
            cancel,
            handle,
        }
    }

    async fn start_next_upload(&mut self) -> Result<()> {
        let candidates = self
            .deps
            .db
            .uploads
            .list_in_state(self.user_id(), UploadState::Ready)
            .await?;

        for job in candidates {
            let key = job.key();
            if !self.deps.acquire(&key).await? {
                continue;
            }
            if !self
                .deps
                .db
                .uploads
                .transition(job.id, UploadState::Ready, UploadState::Uploading)
                .await?
            {
                self.deps.release(&key).await?;
                continue;
            }

            info!(job = %key, position = job.position, "uploading");
            self.uploading = Some(self.spawn_upload(job));
            self.deps.list_changed(Direction::Upload).await;
            return Ok(());
        }
        Ok(())
    }

    fn spawn_upload(&self, job: UploadJob) -> ActiveJob {
        let key = job.key();
        let cancel = CancelFlag::new();
        let deps = self.deps.clone();
        let done_tx = self.done_tx.clone();
        let mut progress = ProgressReporter::new(
            self.progress_tx.clone(),
            Stage::Upload,
            key.clone(),
            job.encrypted_size.unwrap_or(0),
            deps.config.progress_interval(),
        );

        let flag = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = run_upload(
                &deps.db,
                &deps.host,
                &job,
                &flag,
                &mut progress,
                deps.config.verify_timeout(),
            )
            .await;
            match &result {
                Ok(UploadOutcome::Verified) => {
                    progress.finish(job.content_id.clone().unwrap_or_default())
                }
                // Still verifying; the job stays listed as in progress
                Ok(UploadOutcome::VerifyPending(_)) => {}
                Err(_) => progress.fail(),
            }
            let _ = done_tx.send(StageDone::Upload { id: job.id, result });
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
            StageDone::Encryption { id, result } => {
                let reason = self.finish_slot(SlotKind::Encrypting, id);
                let settled = self.settle_encryption(id, result, reason).await;
                self.deps.release(&JobKey::upload(id)).await?;
                settled
            }
            StageDone::Upload { id, result } => {
                let reason = self.finish_slot(SlotKind::Uploading, id);
                let settled = self.settle_upload(id, result, reason).await;
                self.deps.release(&JobKey::upload(id)).await?;
                settled
            }
            StageDone::Verification { id, result } => {
                self.verifying.remove(&id);
                match result {
                    Ok(()) => self.complete_upload(id).await,
                    Err(e) => {
                        warn!(job = %JobKey::upload(id), error = %e, "verification failed");
                        self.fail_upload(id, StageError::from(e)).await
                    }
                }
            }
        }
    }

    /// Empty a stage slot
    ///
    /// Returns the cancel reason the job was stopped with, if any. The job
    /// lease is kept until the result is recorded.
    fn finish_slot(&mut self, kind: SlotKind, id: i64) -> Option<CancelReason> {
        let slot = match kind {
            SlotKind::Encrypting => &mut self.encrypting,
            SlotKind::Uploading => &mut self.uploading,
        };
        let key = JobKey::upload(id);
        let reason = match slot.take() {
            Some(active) if active.key == key => active.cancel.reason(),
            other => {
                *slot = other;
                warn!(job = %key, "completion for a job not in its slot");
                None
            }
        };
        reason
    }

    async fn settle_encryption(
        &mut self,
        id: i64,
        result: std::result::Result<EncryptionResult, StageError>,
        reason: Option<CancelReason>,
    ) -> Result<()> {
        let key = JobKey::upload(id);
        let uploads = &self.deps.db.uploads;

        match result {
            Ok(encrypted) => {
                if !uploads.finish_encryption(id, &encrypted).await? {
                    warn!(job = %key, "job left encrypting while the stage ran");
                    return Ok(());
                }
                uploads
                    .transition(id, UploadState::Generating, UploadState::SendCommand)
                    .await?;
                info!(
                    job = %key,
                    content_id = %encrypted.content_id,
                    size = encrypted.encrypted_size,
                    "encryption finished"
                );
                self.publish_pending(vec![id]).await?;
            }
            Err(StageError::Cancelled) => {
                self.settle_cancelled(id, UploadState::Encrypting, reason)
                    .await?;
            }
            Err(e) => {
                error!(job = %key, error = %e, "encryption failed");
                uploads
                    .mark_error(id, UploadState::Encrypting, UploadState::Error, &e.to_string())
                    .await?;
                self.deps.list_changed(Direction::Upload).await;
            }
        }
        Ok(())
    }

    async fn settle_upload(
        &mut self,
        id: i64,
        result: std::result::Result<UploadOutcome, StageError>,
        reason: Option<CancelReason>,
    ) -> Result<()> {
        match result {
            Ok(UploadOutcome::Verified) => self.complete_upload(id).await,
            Ok(UploadOutcome::VerifyPending(handle)) => {
                self.watch_verification(id, handle);
                Ok(())
            }
            Err(StageError::Cancelled) => {
                self.settle_cancelled(id, UploadState::Uploading, reason)
                    .await
            }
            Err(e) => self.fail_upload(id, e).await,
        }
    }

    /// Resolve a stage that stopped on its cancel flag
    ///
    /// A pause during encryption is treated as a stop: encryption always
    /// restarts from the beginning, so there is nothing to pause.
    async fn settle_cancelled(
        &mut self,
        id: i64,
        from: UploadState,
        reason: Option<CancelReason>,
    ) -> Result<()> {
        let uploads = &self.deps.db.uploads;
        match reason {
            Some(CancelReason::Delete) => return self.delete_job(id).await,
            Some(CancelReason::Pause) if from == UploadState::Uploading => {
                uploads.transition(id, from, UploadState::Paused).await?;
                info!(job = %JobKey::upload(id), "paused");
            }
            _ => {
                uploads
                    .mark_error(id, from, UploadState::Error, CANCELLED_MESSAGE)
                    .await?;
                info!(job = %JobKey::upload(id), "stopped");
            }
        }
        self.deps.list_changed(Direction::Upload).await;
        Ok(())
    }

    /// Record a failed upload or verification
    async fn fail_upload(&mut self, id: i64, err: StageError) -> Result<()> {
        let Some(job) = self.deps.db.uploads.get(id).await? else {
            return Ok(());
        };
        let to = if err.is_transient() {
            UploadState::ErrorDuringPartUpload
        } else {
            UploadState::Error
        };
        if matches!(job.state, UploadState::Uploading | UploadState::Verifying) {
            warn!(job = %job.key(), error = %err, state = %to, "upload failed");
            self.deps
                .db
                .uploads
                .mark_error(id, job.state, to, &err.to_string())
                .await?;
            self.deps.list_changed(Direction::Upload).await;
        }
        Ok(())
    }

    async fn complete_upload(&mut self, id: i64) -> Result<()> {
        let key = JobKey::upload(id);
        if self.deps.db.uploads.complete(id).await? {
            let purged = self.deps.db.parts.delete_all(&key).await?;
            info!(job = %key, parts = purged, "upload verified");
            self.deps.list_changed(Direction::Upload).await;
        }
        Ok(())
    }

    fn watch_verification(
        &mut self,
        id: i64,
        handle: tokio::task::JoinHandle<std::result::Result<(), HostError>>,
    ) {
        if !self.verifying.insert(id) {
            handle.abort();
            return;
        }
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(HostError::Transport(e.to_string())),
            };
            let _ = done_tx.send(StageDone::Verification { id, result });
        });
    }

    async fn delete_job(&mut self, id: i64) -> Result<()> {
        let key = JobKey::upload(id);
        self.encrypt_queue.retain(|queued| *queued != id);
        self.deps.db.parts.delete_all(&key).await?;
        if self.deps.db.uploads.delete(id).await? {
            info!(job = %key, "deleted");
        }
        self.finish_command(id).await?;
        self.deps.list_changed(Direction::Upload).await;
        Ok(())
    }

    /// Announce jobs waiting for the add-file command
    ///
    /// Only commands this instance claims are announced; a command claimed
    /// elsewhere is dropped from the local hub. Announcing again renews the
    /// claim.
    async fn publish_pending(&self, ids: Vec<i64>) -> Result<()> {
        let mut commands = Vec::new();
        for id in ids {
            let Some(job) = self.deps.db.uploads.get(id).await? else {
                continue;
            };
            if job.state != UploadState::SendCommand {
                continue;
            }
            let Some(command) = job.pending_command() else {
                continue;
            };
            if self.deps.claim_command(id).await? {
                commands.push(command);
            } else {
                debug!(job = %job.key(), "add-file command claimed by another instance");
                self.deps.hub.complete_command(id);
            }
        }
        let mut update = CoordinatorUpdate::list_changed(Direction::Upload);
        update.commands_needed = commands;
        self.deps.hub.publish(update).await;
        Ok(())
    }

    /// Drop a command that no longer needs an actor, here and in the store
    async fn finish_command(&self, id: i64) -> Result<()> {
        self.deps.hub.complete_command(id);
        self.deps.release_command(id).await
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Enqueued {
                job: JobKey::Upload { id },
            } => {
                if !self.encrypt_queue.contains(&id) {
                    self.encrypt_queue.push_back(id);
                }
                self.deps.list_changed(Direction::Upload).await;
            }
            Command::Pause {
                job: JobKey::Upload { id },
            } => self.pause(id).await?,
            Command::Resume {
                job: JobKey::Upload { id },
            } => self.resume(id).await?,
            Command::Cancel {
                job: JobKey::Upload { id },
                delete,
            } => self.cancel(id, delete).await?,
            Command::CommandSent { job_id, host_url } => {
                if self.deps.db.uploads.assign_host(job_id, &host_url).await? {
                    info!(job = %JobKey::upload(job_id), host = %host_url, "add-file command sent");
                    self.deps.list_changed(Direction::Upload).await;
                }
                self.finish_command(job_id).await?;
            }
            Command::CommandFailed { job_id } => self.command_failed(job_id).await?,
            Command::Verified { content_id } => {
                for job in self.deps.db.uploads.find_by_content(&content_id).await? {
                    if job.state == UploadState::Verifying {
                        self.complete_upload(job.id).await?;
                    }
                }
            }
            Command::Wake => {}
            other => debug!(command = ?other, "ignoring command for another direction"),
        }
        Ok(())
    }

    async fn pause(&mut self, id: i64) -> Result<()> {
        let key = JobKey::upload(id);
        if cancel_if_active(&self.encrypting, &key, CancelReason::Pause)
            || cancel_if_active(&self.uploading, &key, CancelReason::Pause)
        {
            return Ok(());
        }
        let Some(job) = self.deps.db.uploads.get(id).await? else {
            return Ok(());
        };
        if job.state.can_transition(UploadState::Paused)
            && self
                .deps
                .db
                .uploads
                .transition(id, job.state, UploadState::Paused)
                .await?
        {
            info!(job = %key, "paused");
            self.deps.list_changed(Direction::Upload).await;
        }
        Ok(())
    }

    /// Put a paused or failed job back into the pipeline
    ///
    /// A failed job goes back to `ready` if it still has everything the
    /// upload stage needs, otherwise it is encrypted again.
    async fn resume(&mut self, id: i64) -> Result<()> {
        let Some(job) = self.deps.db.uploads.get(id).await? else {
            return Ok(());
        };
        let now = self.deps.now();
        let uploads = &self.deps.db.uploads;

        let resumed = match job.state {
            UploadState::Paused | UploadState::ErrorDuringPartUpload => {
                uploads.resume(id, job.state, UploadState::Ready, now).await?
            }
            UploadState::Error if job.host_url.is_some() && job.content_id.is_some() => {
                uploads.resume(id, job.state, UploadState::Ready, now).await?
            }
            UploadState::Error => {
                self.deps.db.parts.delete_all(&job.key()).await?;
                let reset = uploads.reset_for_encryption(id, job.state, now).await?;
                if reset && !self.encrypt_queue.contains(&id) {
                    self.encrypt_queue.push_back(id);
                }
                reset
            }
            state => {
                debug!(job = %job.key(), %state, "not resumable");
                false
            }
        };
        if resumed {
            info!(job = %job.key(), "resumed");
            self.deps.list_changed(Direction::Upload).await;
        }
        Ok(())
    }

    async fn cancel(&mut self, id: i64, delete: bool) -> Result<()> {
        let key = JobKey::upload(id);
        let reason = if delete {
            CancelReason::Delete
        } else {
            CancelReason::Stop
        };
        if cancel_if_active(&self.encrypting, &key, reason)
            || cancel_if_active(&self.uploading, &key, reason)
        {
            return Ok(());
        }

        if delete {
            return self.delete_job(id).await;
        }
        let Some(job) = self.deps.db.uploads.get(id).await? else {
            return Ok(());
        };
        if !matches!(job.state, UploadState::Done | UploadState::Error) {
            self.encrypt_queue.retain(|queued| *queued != id);
            self.deps
                .db
                .uploads
                .mark_error(id, job.state, UploadState::Error, CANCELLED_MESSAGE)
                .await?;
            self.finish_command(id).await?;
            info!(job = %key, "stopped");
            self.deps.list_changed(Direction::Upload).await;
        }
        Ok(())
    }

    async fn command_failed(&mut self, id: i64) -> Result<()> {
        let Some(attempts) = self.deps.db.uploads.bump_command_retries(id).await? else {
            self.finish_command(id).await?;
            return Ok(());
        };
        let cap = self.deps.config.command_max_retries;
        if attempts >= cap {
            warn!(job = %JobKey::upload(id), attempts, "add-file command failed, giving up");
            self.deps
                .db
                .uploads
                .mark_error(
                    id,
                    UploadState::SendCommand,
                    UploadState::Error,
                    "add-file command failed",
                )
                .await?;
            self.finish_command(id).await?;
            self.deps.list_changed(Direction::Upload).await;
        } else {
            debug!(job = %JobKey::upload(id), attempts, "add-file command failed, will retry");
            self.deps.hub.release_command(id);
        }
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Periodic housekeeping
    ///
    /// Renews the leases of running jobs, recovers jobs whose owner went away,
    /// promotes transient failures back to `ready`, restarts verifications and
    /// refills the encryption queue.
    async fn maintenance(&mut self) -> Result<()> {
        let db = self.deps.db.clone();
        let now = self.deps.now();
        let user = self.deps.config.user_id.clone();
        let mut changed = false;

        db.leases.purge_expired(now).await?;
        for active in [&self.encrypting, &self.uploading].into_iter().flatten() {
            if !self.deps.acquire(&active.key).await? {
                warn!(job = %active.key, "lease lost to another instance");
            }
        }

        for job in db.uploads.list_in_state(&user, UploadState::Encrypting).await? {
            let key = job.key();
            if self.is_local(&key) || !self.deps.acquire(&key).await? {
                continue;
            }
            info!(job = %key, "recovering interrupted encryption");
            db.parts.delete_all(&key).await?;
            changed |= db
                .uploads
                .reset_for_encryption(job.id, UploadState::Encrypting, now)
                .await?;
            self.deps.release(&key).await?;
        }

        for job in db.uploads.list_in_state(&user, UploadState::Uploading).await? {
            let key = job.key();
            if self.is_local(&key) || !self.deps.acquire(&key).await? {
                continue;
            }
            info!(job = %key, position = job.position, "recovering interrupted upload");
            changed |= db
                .uploads
                .transition(job.id, UploadState::Uploading, UploadState::Ready)
                .await?;
            self.deps.release(&key).await?;
        }

        // Crash between recording the encryption result and the state change
        for job in db.uploads.list_in_state(&user, UploadState::Generating).await? {
            changed |= db
                .uploads
                .transition(job.id, UploadState::Generating, UploadState::SendCommand)
                .await?;
        }

        let max_retries = self.deps.config.max_retries;
        for job in db
            .uploads
            .list_in_state(&user, UploadState::ErrorDuringPartUpload)
            .await?
        {
            if job.retries < max_retries {
                debug!(job = %job.key(), retries = job.retries, "retrying upload");
                changed |= db
                    .uploads
                    .requeue(job.id, job.state, UploadState::Ready, now)
                    .await?;
            } else {
                warn!(job = %job.key(), retries = job.retries, "upload retry limit reached");
                changed |= db
                    .uploads
                    .mark_error(job.id, job.state, UploadState::Error, RETRY_LIMIT_MESSAGE)
                    .await?;
            }
        }

        for job in db.uploads.list_in_state(&user, UploadState::Verifying).await? {
            let key = job.key();
            if self.verifying.contains(&job.id)
                || self.is_local(&key)
                || !self.deps.acquire(&key).await?
            {
                continue;
            }
            if let (Some(host_url), Some(content_id)) = (&job.host_url, &job.content_id) {
                debug!(job = %key, "restarting verification");
                let handle = spawn_finalize(&self.deps.host, host_url, content_id);
                self.watch_verification(job.id, handle);
            }
            self.deps.release(&key).await?;
        }

        let pending: Vec<i64> = db
            .uploads
            .list_in_state(&user, UploadState::SendCommand)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        if !pending.is_empty() {
            self.publish_pending(pending).await?;
        }

        for job in db.uploads.list_in_state(&user, UploadState::Initial).await? {
            if !self.encrypt_queue.contains(&job.id) {
                self.encrypt_queue.push_back(job.id);
            }
        }

        if changed {
            self.deps.list_changed(Direction::Upload).await;
        }
        Ok(())
    }

    fn is_local(&self, key: &JobKey) -> bool {
        [&self.encrypting, &self.uploading]
            .into_iter()
            .flatten()
            .any(|active| &active.key == key)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Abort running stages and leave their jobs restartable
    async fn shutdown(&mut self) {
        let db = &self.deps.db;
        let now = self.deps.now();

        if let Some(active) = self.encrypting.take() {
            active.handle.abort();
            let _ = active.handle.await;
            if let JobKey::Upload { id } = active.key
                && let Err(e) = db
                    .uploads
                    .reset_for_encryption(id, UploadState::Encrypting, now)
                    .await
            {
                warn!(job = %active.key, error = %e, "failed to reset encryption");
            }
        }
        if let Some(active) = self.uploading.take() {
            active.handle.abort();
            let _ = active.handle.await;
            // A job that reached verifying is picked up again by maintenance
            if let JobKey::Upload { id } = active.key
                && let Err(e) = db
                    .uploads
                    .transition(id, UploadState::Uploading, UploadState::Ready)
                    .await
            {
                warn!(job = %active.key, error = %e, "failed to reset upload");
            }
        }
        if let Err(e) = db.leases.release_all(&self.deps.instance_id).await {
            warn!(error = %e, "failed to release leases");
        }
    }
}

#[derive(Clone, Copy)]
enum SlotKind {
    Encrypting,
    Uploading,
}
