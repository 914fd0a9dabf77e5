//! Job store
//!
//! SQLite database holding upload and download jobs, their ciphertext parts
//! and the leases that keep instances from working on the same job. Several
//! engine instances may open the same file; every state change is a
//! compare-and-set so concurrent writers cannot silently overwrite each other.

mod downloads;
mod leases;
mod parts;
pub mod sql;
mod uploads;

#[cfg(test)]
pub mod testing;

pub use downloads::{DownloadDb, DownloadJob, NewDownload};
pub use leases::LeaseDb;
pub use parts::{Part, PartsDb};
pub use uploads::{EncryptionResult, NewUpload, UploadDb, UploadJob};

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// How long a connection waits on a lock held by another instance
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum pooled connections per instance
const MAX_CONNECTIONS: u32 = 4;

/// Database handle grouping the per-table accessors
///
/// `SqlitePool` uses `Arc` internally, so cloning is cheap.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
    pub uploads: UploadDb,
    pub downloads: DownloadDb,
    pub parts: PartsDb,
    pub leases: LeaseDb,
}

impl Database {
    /// Wrap an open pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            uploads: UploadDb::new(pool.clone()),
            downloads: DownloadDb::new(pool.clone()),
            parts: PartsDb::new(pool.clone()),
            leases: LeaseDb::new(pool.clone()),
            pool,
        }
    }

    /// Open (creating if needed) the database file and run migrations
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::new(pool))
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Read a non-negative integer column
///
/// Negative values never come from the engine; they are clamped to zero.
pub(crate) fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

/// Convert a size or position for storage
pub(crate) fn to_db_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
