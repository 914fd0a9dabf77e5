//! Ciphertext part storage
//!
//! Parts of one job are keyed by byte position. Upload parts belong to an
//! upload job id, download parts to a (content id, user id) pair; both are
//! addressed through [`JobKey`].

use sqlx::sqlite::SqlitePool;

use sealbox_common::JobKey;

use crate::db::{sql, to_db_u64, to_u64};
use crate::error::Result;

/// A stored part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub position: u64,
    pub data: Vec<u8>,
}

impl Part {
    /// Position just past the end of this part
    pub fn end(&self) -> u64 {
        self.position + self.data.len() as u64
    }
}

/// Database access for upload and download parts
#[derive(Clone)]
pub struct PartsDb {
    pool: SqlitePool,
}

impl PartsDb {
    /// Create a new PartsDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a part at `position`, replacing any earlier write there
    ///
    /// The insert is a single statement, so a part is either fully stored or absent.
    pub async fn put(&self, job: &JobKey, position: u64, data: &[u8]) -> Result<()> {
        let position = to_db_u64(position);
        match job {
            JobKey::Upload { id } => {
                sqlx::query(sql::SQL_PUT_UPLOAD_PART)
                    .bind(id)
                    .bind(position)
                    .bind(data)
                    .execute(&self.pool)
                    .await?;
            }
            JobKey::Download {
                content_id,
                user_id,
            } => {
                sqlx::query(sql::SQL_PUT_DOWNLOAD_PART)
                    .bind(content_id)
                    .bind(user_id)
                    .bind(position)
                    .bind(data)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// First part starting at or after `position`
    pub async fn next_from(&self, job: &JobKey, position: u64) -> Result<Option<Part>> {
        let position = to_db_u64(position);
        let row: Option<(i64, Vec<u8>)> = match job {
            JobKey::Upload { id } => {
                sqlx::query_as(sql::SQL_NEXT_UPLOAD_PART)
                    .bind(id)
                    .bind(position)
                    .fetch_optional(&self.pool)
                    .await?
            }
            JobKey::Download {
                content_id,
                user_id,
            } => {
                sqlx::query_as(sql::SQL_NEXT_DOWNLOAD_PART)
                    .bind(content_id)
                    .bind(user_id)
                    .bind(position)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        Ok(row.map(|(position, data)| Part {
            position: to_u64(position),
            data,
        }))
    }

    /// `(position, length)` of every part in position order
    pub async fn extents(&self, job: &JobKey) -> Result<Vec<(u64, u64)>> {
        let rows: Vec<(i64, i64)> = match job {
            JobKey::Upload { id } => {
                sqlx::query_as(sql::SQL_UPLOAD_PART_EXTENTS)
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
            }
            JobKey::Download {
                content_id,
                user_id,
            } => {
                sqlx::query_as(sql::SQL_DOWNLOAD_PART_EXTENTS)
                    .bind(content_id)
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(position, len)| (to_u64(position), to_u64(len)))
            .collect())
    }

    /// Part positions in order
    pub async fn positions(&self, job: &JobKey) -> Result<Vec<u64>> {
        Ok(self
            .extents(job)
            .await?
            .into_iter()
            .map(|(position, _)| position)
            .collect())
    }

    /// Total bytes stored for a job
    pub async fn total_len(&self, job: &JobKey) -> Result<u64> {
        Ok(self.extents(job).await?.iter().map(|(_, len)| len).sum())
    }

    /// Length of the gap-free prefix starting at byte zero
    ///
    /// A part that does not start where the previous one ended ends the prefix.
    pub async fn contiguous_len(&self, job: &JobKey) -> Result<u64> {
        let mut end = 0;
        for (position, len) in self.extents(job).await? {
            if position != end {
                break;
            }
            end += len;
        }
        Ok(end)
    }

    /// Delete every part of a job
    pub async fn delete_all(&self, job: &JobKey) -> Result<u64> {
        let result = match job {
            JobKey::Upload { id } => {
                sqlx::query(sql::SQL_DELETE_UPLOAD_PARTS)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            JobKey::Download {
                content_id,
                user_id,
            } => {
                sqlx::query(sql::SQL_DELETE_DOWNLOAD_PARTS)
                    .bind(content_id)
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::create_test_db;

    /// Read every part in order and concatenate
    async fn read_back(parts: &PartsDb, job: &JobKey) -> Vec<u8> {
        let mut out = Vec::new();
        let mut position = 0;
        while let Some(part) = parts.next_from(job, position).await.unwrap() {
            assert_eq!(part.position, position, "gap before part");
            position = part.end();
            out.extend_from_slice(&part.data);
        }
        out
    }

    #[tokio::test]
    async fn test_parts_round_trip_in_position_order() {
        let db = create_test_db().await;
        let job = JobKey::upload(1);
        let stream: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();

        // Written out of order, read back in order
        let cuts = [0usize, 3000, 6000, 9000, 10_000];
        for window in cuts.windows(2).rev() {
            db.parts
                .put(&job, window[0] as u64, &stream[window[0]..window[1]])
                .await
                .unwrap();
        }

        assert_eq!(read_back(&db.parts, &job).await, stream);
        assert_eq!(db.parts.positions(&job).await.unwrap(), vec![0, 3000, 6000, 9000]);
        assert_eq!(db.parts.total_len(&job).await.unwrap(), 10_000);
        assert_eq!(db.parts.contiguous_len(&job).await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_jobs_do_not_share_parts() {
        let db = create_test_db().await;
        let upload = JobKey::upload(1);
        let other = JobKey::upload(2);
        let download = JobKey::download("c1", "alice");

        db.parts.put(&upload, 0, b"up").await.unwrap();
        db.parts.put(&other, 0, b"other").await.unwrap();
        db.parts.put(&download, 0, b"down").await.unwrap();

        assert_eq!(db.parts.delete_all(&upload).await.unwrap(), 1);
        assert_eq!(db.parts.next_from(&upload, 0).await.unwrap(), None);
        assert_eq!(read_back(&db.parts, &other).await, b"other");
        assert_eq!(read_back(&db.parts, &download).await, b"down");
    }

    #[tokio::test]
    async fn test_next_from_skips_consumed_parts() {
        let db = create_test_db().await;
        let job = JobKey::download("c1", "alice");
        db.parts.put(&job, 0, &[1; 10]).await.unwrap();
        db.parts.put(&job, 10, &[2; 10]).await.unwrap();

        let part = db.parts.next_from(&job, 10).await.unwrap().unwrap();
        assert_eq!(part.position, 10);
        assert_eq!(part.data, vec![2; 10]);
        assert_eq!(db.parts.next_from(&job, 20).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contiguous_len_stops_at_gap() {
        let db = create_test_db().await;
        let job = JobKey::upload(9);
        db.parts.put(&job, 0, &[0; 4]).await.unwrap();
        db.parts.put(&job, 8, &[0; 4]).await.unwrap();
        assert_eq!(db.parts.contiguous_len(&job).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_part() {
        let db = create_test_db().await;
        let job = JobKey::upload(3);
        db.parts.put(&job, 0, b"first").await.unwrap();
        db.parts.put(&job, 0, b"again").await.unwrap();
        assert_eq!(read_back(&db.parts, &job).await, b"again");
    }
}
