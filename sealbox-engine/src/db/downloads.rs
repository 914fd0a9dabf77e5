//! Download job database operations

use std::collections::BTreeMap;
use std::path::PathBuf;

use sqlx::sqlite::SqlitePool;

use sealbox_common::{DownloadState, JobKey, object_url};

use crate::db::{sql, to_db_u64, to_u64};
use crate::error::{EngineError, Result};

/// A download job from the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub content_id: String,
    pub user_id: String,
    pub state: DownloadState,
    pub enqueued_at: i64,
    /// Filehost URL to last-seen time in millis
    pub locations: BTreeMap<String, i64>,
    /// Ciphertext bytes stored in the buffer file
    pub position: u64,
    pub encrypted_size: Option<u64>,
    pub format: String,
    /// Hex key; erased once decryption succeeds
    pub key: Option<String>,
    /// Hex stream header
    pub nonce: String,
    pub retries: u32,
    pub output_path: PathBuf,
    /// Publish the finished file for automatic opening
    pub auto_open: bool,
    /// Whether maintenance may retry an `error` job
    pub retryable: bool,
    pub error: Option<String>,
}

impl DownloadJob {
    pub fn key(&self) -> JobKey {
        JobKey::download(&self.content_id, &self.user_id)
    }

    /// Object URL on the most recently seen filehost
    pub fn stream_url(&self) -> Option<String> {
        self.locations
            .iter()
            .max_by_key(|&(host, seen)| (*seen, std::cmp::Reverse(host.as_str())))
            .map(|(host, _)| object_url(host, &self.content_id))
    }
}

/// Raw download row
#[derive(sqlx::FromRow)]
struct DownloadRow {
    content_id: String,
    user_id: String,
    state: String,
    enqueued_at: i64,
    locations: String,
    position: i64,
    encrypted_size: Option<i64>,
    format: String,
    key: Option<String>,
    nonce: String,
    retries: i64,
    output_path: String,
    auto_open: bool,
    retryable: bool,
    error: Option<String>,
}

impl TryFrom<DownloadRow> for DownloadJob {
    type Error = EngineError;

    fn try_from(row: DownloadRow) -> Result<Self> {
        let corrupt = |reason: String| EngineError::CorruptRecord {
            job: JobKey::download(&row.content_id, &row.user_id).to_string(),
            reason,
        };
        let state = DownloadState::parse(&row.state)
            .ok_or_else(|| corrupt(format!("unknown state '{}'", row.state)))?;
        let locations = serde_json::from_str(&row.locations)
            .map_err(|e| corrupt(format!("invalid locations: {e}")))?;

        Ok(Self {
            content_id: row.content_id,
            user_id: row.user_id,
            state,
            enqueued_at: row.enqueued_at,
            locations,
            position: to_u64(row.position),
            encrypted_size: row.encrypted_size.map(to_u64),
            format: row.format,
            key: row.key,
            nonce: row.nonce,
            retries: row.retries.clamp(0, u32::MAX as i64) as u32,
            output_path: PathBuf::from(row.output_path),
            auto_open: row.auto_open,
            retryable: row.retryable,
            error: row.error,
        })
    }
}

/// Fields supplied when a download is requested
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub content_id: String,
    pub user_id: String,
    pub host_url: String,
    pub encrypted_size: Option<u64>,
    pub format: String,
    pub key: String,
    pub nonce: String,
    pub output_path: PathBuf,
    pub auto_open: bool,
}

fn check_transition(content_id: &str, user_id: &str, from: DownloadState, to: DownloadState) -> Result<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            job: JobKey::download(content_id, user_id).to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn collect(rows: Vec<DownloadRow>) -> Result<Vec<DownloadJob>> {
    rows.into_iter().map(DownloadJob::try_from).collect()
}

/// Database access for download jobs
#[derive(Clone)]
pub struct DownloadDb {
    pool: SqlitePool,
}

impl DownloadDb {
    /// Create a new DownloadDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a job in `initial`
    ///
    /// Requesting a download that already exists only refreshes its location.
    /// Returns true if a new job was created.
    pub async fn insert(&self, new: &NewDownload, now: i64) -> Result<bool> {
        let locations = BTreeMap::from([(new.host_url.clone(), now)]);
        let locations =
            serde_json::to_string(&locations).map_err(|e| EngineError::Config(e.to_string()))?;

        let result = sqlx::query(sql::SQL_INSERT_DOWNLOAD)
            .bind(&new.content_id)
            .bind(&new.user_id)
            .bind(DownloadState::Initial.as_str())
            .bind(now)
            .bind(&locations)
            .bind(new.encrypted_size.map(to_db_u64))
            .bind(&new.format)
            .bind(&new.key)
            .bind(&new.nonce)
            .bind(new.output_path.to_string_lossy().as_ref())
            .bind(new.auto_open)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.touch_location(&new.content_id, &new.user_id, &new.host_url, now)
            .await?;
        Ok(false)
    }

    pub async fn get(&self, content_id: &str, user_id: &str) -> Result<Option<DownloadJob>> {
        let row: Option<DownloadRow> = sqlx::query_as(sql::SQL_SELECT_DOWNLOAD)
            .bind(content_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DownloadJob::try_from).transpose()
    }

    /// All jobs of a user, oldest first
    pub async fn list(&self, user_id: &str) -> Result<Vec<DownloadJob>> {
        let rows: Vec<DownloadRow> = sqlx::query_as(sql::SQL_SELECT_DOWNLOADS_FOR_USER)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        collect(rows)
    }

    /// Jobs of a user in `state`, oldest first
    pub async fn list_in_state(&self, user_id: &str, state: DownloadState) -> Result<Vec<DownloadJob>> {
        let rows: Vec<DownloadRow> = sqlx::query_as(sql::SQL_SELECT_DOWNLOADS_IN_STATE)
            .bind(user_id)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        collect(rows)
    }

    /// Oldest job of a user in `state`
    pub async fn next_in_state(&self, user_id: &str, state: DownloadState) -> Result<Option<DownloadJob>> {
        Ok(self.list_in_state(user_id, state).await?.into_iter().next())
    }

    /// Compare-and-set the job state
    ///
    /// Returns false if the job is no longer in `from`.
    pub async fn transition(
        &self,
        content_id: &str,
        user_id: &str,
        from: DownloadState,
        to: DownloadState,
    ) -> Result<bool> {
        check_transition(content_id, user_id, from, to)?;
        let result = sqlx::query(sql::SQL_TRANSITION_DOWNLOAD)
            .bind(to.as_str())
            .bind(content_id)
            .bind(user_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist the position of a `downloading` job; never moves backwards
    pub async fn set_position(&self, content_id: &str, user_id: &str, position: u64) -> Result<bool> {
        let position = to_db_u64(position);
        let result = sqlx::query(sql::SQL_SET_DOWNLOAD_POSITION)
            .bind(position)
            .bind(content_id)
            .bind(user_id)
            .bind(DownloadState::Downloading.as_str())
            .bind(position)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Restart a `downloading` job from byte zero
    pub async fn reset_position(&self, content_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query(sql::SQL_RESET_DOWNLOAD_POSITION)
            .bind(content_id)
            .bind(user_id)
            .bind(DownloadState::Downloading.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that the object was seen on `host_url`
    pub async fn touch_location(
        &self,
        content_id: &str,
        user_id: &str,
        host_url: &str,
        now: i64,
    ) -> Result<bool> {
        let Some(job) = self.get(content_id, user_id).await? else {
            return Ok(false);
        };

        let mut locations = job.locations;
        locations.insert(host_url.to_string(), now);
        let locations =
            serde_json::to_string(&locations).map_err(|e| EngineError::Config(e.to_string()))?;

        let result = sqlx::query(sql::SQL_SET_DOWNLOAD_LOCATIONS)
            .bind(&locations)
            .bind(content_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a completed transfer, moving `downloading` to `encrypted`
    pub async fn finish_download(&self, content_id: &str, user_id: &str, size: u64) -> Result<bool> {
        check_transition(content_id, user_id, DownloadState::Downloading, DownloadState::Encrypted)?;
        let size = to_db_u64(size);
        let result = sqlx::query(sql::SQL_FINISH_DOWNLOAD)
            .bind(DownloadState::Encrypted.as_str())
            .bind(size)
            .bind(size)
            .bind(content_id)
            .bind(user_id)
            .bind(DownloadState::Downloading.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a job to `error`
    pub async fn mark_error(
        &self,
        content_id: &str,
        user_id: &str,
        from: DownloadState,
        message: &str,
        retryable: bool,
    ) -> Result<bool> {
        check_transition(content_id, user_id, from, DownloadState::Error)?;
        let result = sqlx::query(sql::SQL_MARK_DOWNLOAD_ERROR)
            .bind(DownloadState::Error.as_str())
            .bind(message)
            .bind(retryable)
            .bind(content_id)
            .bind(user_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Automatic retry of an `error` job: retry counter bumped, moved to the back of the queue
    pub async fn requeue(&self, content_id: &str, user_id: &str, now: i64) -> Result<bool> {
        check_transition(content_id, user_id, DownloadState::Error, DownloadState::Initial)?;
        let result = sqlx::query(sql::SQL_REQUEUE_DOWNLOAD)
            .bind(DownloadState::Initial.as_str())
            .bind(now)
            .bind(content_id)
            .bind(user_id)
            .bind(DownloadState::Error.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// User resume of a `paused` or `error` job with a fresh retry budget
    pub async fn resume(&self, content_id: &str, user_id: &str, from: DownloadState, now: i64) -> Result<bool> {
        check_transition(content_id, user_id, from, DownloadState::Initial)?;
        let result = sqlx::query(sql::SQL_RESUME_DOWNLOAD)
            .bind(DownloadState::Initial.as_str())
            .bind(now)
            .bind(content_id)
            .bind(user_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Demote an `encrypted` job whose decryption failed to `paused`
    pub async fn demote_after_decryption_failure(
        &self,
        content_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<bool> {
        check_transition(content_id, user_id, DownloadState::Encrypted, DownloadState::Paused)?;
        let result = sqlx::query(sql::SQL_DEMOTE_DOWNLOAD)
            .bind(DownloadState::Paused.as_str())
            .bind(message)
            .bind(content_id)
            .bind(user_id)
            .bind(DownloadState::Encrypted.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark an `encrypted` job `done` and erase its key
    pub async fn finish_decryption(&self, content_id: &str, user_id: &str) -> Result<bool> {
        check_transition(content_id, user_id, DownloadState::Encrypted, DownloadState::Done)?;
        let result = sqlx::query(sql::SQL_FINISH_DECRYPTION)
            .bind(DownloadState::Done.as_str())
            .bind(content_id)
            .bind(user_id)
            .bind(DownloadState::Encrypted.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a job
    ///
    /// Returns true if the job existed.
    pub async fn delete(&self, content_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query(sql::SQL_DELETE_DOWNLOAD)
            .bind(content_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
