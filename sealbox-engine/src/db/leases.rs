//! Cross-instance leases
//!
//! A lease is a named row with an owner and an expiry. Acquisition never
//! blocks: it either takes a free, expired or already-owned lease, or reports
//! that another instance holds it.

use sqlx::sqlite::SqlitePool;

use crate::db::sql;
use crate::error::Result;

/// Database access for leases
#[derive(Clone)]
pub struct LeaseDb {
    pool: SqlitePool,
}

impl LeaseDb {
    /// Create a new LeaseDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Try to take or extend `name` for `owner` until `now + ttl_millis`
    ///
    /// Returns false if another owner holds an unexpired lease.
    pub async fn try_acquire(&self, name: &str, owner: &str, now: i64, ttl_millis: i64) -> Result<bool> {
        let result = sqlx::query(sql::SQL_ACQUIRE_LEASE)
            .bind(name)
            .bind(owner)
            .bind(now.saturating_add(ttl_millis))
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release `name` if `owner` holds it
    pub async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query(sql::SQL_RELEASE_LEASE)
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release every lease held by `owner`
    pub async fn release_all(&self, owner: &str) -> Result<u64> {
        let result = sqlx::query(sql::SQL_RELEASE_ALL_LEASES)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Owner of an unexpired lease
    pub async fn holder(&self, name: &str, now: i64) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(sql::SQL_SELECT_LEASE_HOLDER)
            .bind(name)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(owner,)| owner))
    }

    /// Delete expired leases
    pub async fn purge_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(sql::SQL_PURGE_EXPIRED_LEASES)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
