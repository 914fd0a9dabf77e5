//! Upload job database operations

use std::path::PathBuf;

use sqlx::sqlite::SqlitePool;

use sealbox_common::{JobKey, PendingCommand, UploadState};

use crate::db::{sql, to_db_u64, to_u64};
use crate::error::{EngineError, Result};

/// An upload job from the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub id: i64,
    pub user_id: String,
    pub state: UploadState,
    pub enqueued_at: i64,
    /// Cleartext file to encrypt
    pub source_path: PathBuf,
    /// Destination directory in the collection
    pub directory: String,
    pub display_path: String,
    pub clear_size: u64,
    /// Known once encryption finished
    pub encrypted_size: Option<u64>,
    /// Ciphertext bytes accepted by the filehost
    pub position: u64,
    pub retries: u32,
    pub command_retries: u32,
    pub host_url: Option<String>,
    pub content_id: Option<String>,
    pub format: Option<String>,
    /// Hex stream header
    pub nonce: Option<String>,
    pub error: Option<String>,
}

impl UploadJob {
    pub fn key(&self) -> JobKey {
        JobKey::upload(self.id)
    }

    /// Add-file command payload, once encryption results are recorded
    pub fn pending_command(&self) -> Option<PendingCommand> {
        Some(PendingCommand {
            job_id: self.id,
            user_id: self.user_id.clone(),
            content_id: self.content_id.clone()?,
            encrypted_size: self.encrypted_size?,
            directory: self.directory.clone(),
            display_path: self.display_path.clone(),
            format: self.format.clone()?,
            nonce: self.nonce.clone()?,
        })
    }
}

/// Raw upload row
#[derive(sqlx::FromRow)]
struct UploadRow {
    id: i64,
    user_id: String,
    state: String,
    enqueued_at: i64,
    source_path: String,
    directory: String,
    display_path: String,
    clear_size: i64,
    encrypted_size: Option<i64>,
    position: i64,
    retries: i64,
    command_retries: i64,
    host_url: Option<String>,
    content_id: Option<String>,
    format: Option<String>,
    nonce: Option<String>,
    error: Option<String>,
}

impl TryFrom<UploadRow> for UploadJob {
    type Error = EngineError;

    fn try_from(row: UploadRow) -> Result<Self> {
        let state = UploadState::parse(&row.state).ok_or_else(|| EngineError::CorruptRecord {
            job: JobKey::upload(row.id).to_string(),
            reason: format!("unknown state '{}'", row.state),
        })?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            state,
            enqueued_at: row.enqueued_at,
            source_path: PathBuf::from(row.source_path),
            directory: row.directory,
            display_path: row.display_path,
            clear_size: to_u64(row.clear_size),
            encrypted_size: row.encrypted_size.map(to_u64),
            position: to_u64(row.position),
            retries: row.retries.clamp(0, u32::MAX as i64) as u32,
            command_retries: row.command_retries.clamp(0, u32::MAX as i64) as u32,
            host_url: row.host_url,
            content_id: row.content_id,
            format: row.format,
            nonce: row.nonce,
            error: row.error,
        })
    }
}

/// Fields supplied when a file is attached
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub user_id: String,
    pub source_path: PathBuf,
    pub directory: String,
    pub display_path: String,
    pub clear_size: u64,
}

/// Encryption results recorded on the job
#[derive(Debug, Clone)]
pub struct EncryptionResult {
    pub encrypted_size: u64,
    pub content_id: String,
    pub format: String,
    pub nonce: String,
}

fn check_transition(id: i64, from: UploadState, to: UploadState) -> Result<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            job: JobKey::upload(id).to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn collect(rows: Vec<UploadRow>) -> Result<Vec<UploadJob>> {
    rows.into_iter().map(UploadJob::try_from).collect()
}

/// Database access for upload jobs
#[derive(Clone)]
pub struct UploadDb {
    pool: SqlitePool,
}

impl UploadDb {
    /// Create a new UploadDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a job in `initial`
    ///
    /// Returns the created job.
    pub async fn insert(&self, new: &NewUpload, now: i64) -> Result<UploadJob> {
        let result = sqlx::query(sql::SQL_INSERT_UPLOAD)
            .bind(&new.user_id)
            .bind(UploadState::Initial.as_str())
            .bind(now)
            .bind(new.source_path.to_string_lossy().as_ref())
            .bind(&new.directory)
            .bind(&new.display_path)
            .bind(to_db_u64(new.clear_size))
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(JobKey::upload(id).to_string()))
    }

    pub async fn get(&self, id: i64) -> Result<Option<UploadJob>> {
        let row: Option<UploadRow> = sqlx::query_as(sql::SQL_SELECT_UPLOAD)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(UploadJob::try_from).transpose()
    }

    /// All jobs of a user, oldest first
    pub async fn list(&self, user_id: &str) -> Result<Vec<UploadJob>> {
        let rows: Vec<UploadRow> = sqlx::query_as(sql::SQL_SELECT_UPLOADS_FOR_USER)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        collect(rows)
    }

    /// Jobs of a user in `state`, oldest first
    pub async fn list_in_state(&self, user_id: &str, state: UploadState) -> Result<Vec<UploadJob>> {
        let rows: Vec<UploadRow> = sqlx::query_as(sql::SQL_SELECT_UPLOADS_IN_STATE)
            .bind(user_id)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        collect(rows)
    }

    /// Jobs of every user in `state`
    pub async fn list_in_state_all_users(&self, state: UploadState) -> Result<Vec<UploadJob>> {
        let rows: Vec<UploadRow> = sqlx::query_as(sql::SQL_SELECT_UPLOADS_IN_STATE_ALL_USERS)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        collect(rows)
    }

    /// Oldest job of a user in `state`
    pub async fn next_in_state(&self, user_id: &str, state: UploadState) -> Result<Option<UploadJob>> {
        Ok(self.list_in_state(user_id, state).await?.into_iter().next())
    }

    /// Jobs carrying a content identifier
    pub async fn find_by_content(&self, content_id: &str) -> Result<Vec<UploadJob>> {
        let rows: Vec<UploadRow> = sqlx::query_as(sql::SQL_SELECT_UPLOADS_BY_CONTENT)
            .bind(content_id)
            .fetch_all(&self.pool)
            .await?;

        collect(rows)
    }

    /// Compare-and-set the job state
    ///
    /// Returns false if the job is no longer in `from`. An edge the state
    /// machine does not allow is an error.
    pub async fn transition(&self, id: i64, from: UploadState, to: UploadState) -> Result<bool> {
        check_transition(id, from, to)?;
        let result = sqlx::query(sql::SQL_TRANSITION_UPLOAD)
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record encryption results, moving `encrypting` to `generating`
    pub async fn finish_encryption(&self, id: i64, result: &EncryptionResult) -> Result<bool> {
        check_transition(id, UploadState::Encrypting, UploadState::Generating)?;
        let done = sqlx::query(sql::SQL_FINISH_ENCRYPTION)
            .bind(UploadState::Generating.as_str())
            .bind(to_db_u64(result.encrypted_size))
            .bind(&result.content_id)
            .bind(&result.format)
            .bind(&result.nonce)
            .bind(id)
            .bind(UploadState::Encrypting.as_str())
            .execute(&self.pool)
            .await?;

        Ok(done.rows_affected() > 0)
    }

    /// Record the filehost after the add-file command, moving `send_command` to `ready`
    pub async fn assign_host(&self, id: i64, host_url: &str) -> Result<bool> {
        check_transition(id, UploadState::SendCommand, UploadState::Ready)?;
        let result = sqlx::query(sql::SQL_ASSIGN_UPLOAD_HOST)
            .bind(UploadState::Ready.as_str())
            .bind(host_url)
            .bind(id)
            .bind(UploadState::SendCommand.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count a failed add-file command
    ///
    /// Returns the updated counter, or None if the job is not waiting for a command.
    pub async fn bump_command_retries(&self, id: i64) -> Result<Option<u32>> {
        let result = sqlx::query(sql::SQL_BUMP_COMMAND_RETRIES)
            .bind(id)
            .bind(UploadState::SendCommand.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(self.get(id).await?.map(|job| job.command_retries))
    }

    /// Persist the upload position of an `uploading` job
    pub async fn set_position(&self, id: i64, position: u64) -> Result<bool> {
        let position = to_db_u64(position);
        let result = sqlx::query(sql::SQL_SET_UPLOAD_POSITION)
            .bind(position)
            .bind(id)
            .bind(UploadState::Uploading.as_str())
            .bind(position)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a job to `error` or `error_during_part_upload` with a message
    pub async fn mark_error(
        &self,
        id: i64,
        from: UploadState,
        to: UploadState,
        message: &str,
    ) -> Result<bool> {
        check_transition(id, from, to)?;
        let result = sqlx::query(sql::SQL_MARK_UPLOAD_ERROR)
            .bind(to.as_str())
            .bind(message)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Automatic retry: back to `to`, retry counter bumped, moved to the back of the queue
    pub async fn requeue(&self, id: i64, from: UploadState, to: UploadState, now: i64) -> Result<bool> {
        check_transition(id, from, to)?;
        let result = sqlx::query(sql::SQL_REQUEUE_UPLOAD)
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// User resume: back to `to` with a fresh retry budget
    pub async fn resume(&self, id: i64, from: UploadState, to: UploadState, now: i64) -> Result<bool> {
        check_transition(id, from, to)?;
        let result = sqlx::query(sql::SQL_RESUME_UPLOAD)
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Forget encryption results and return the job to `initial`
    pub async fn reset_for_encryption(&self, id: i64, from: UploadState, now: i64) -> Result<bool> {
        check_transition(id, from, UploadState::Initial)?;
        let result = sqlx::query(sql::SQL_RESET_UPLOAD_FOR_ENCRYPTION)
            .bind(UploadState::Initial.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a `verifying` job to `done`
    pub async fn complete(&self, id: i64) -> Result<bool> {
        self.transition(id, UploadState::Verifying, UploadState::Done)
            .await
    }

    /// Delete a job
    ///
    /// Returns true if the job existed.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(sql::SQL_DELETE_UPLOAD)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
