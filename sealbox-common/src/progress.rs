//! Transfer progress payloads
//!
//! Progress is produced continuously by active stages and never persisted: the
//! job record always holds enough to rebuild it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which half of the pipeline a job belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Pipeline stage that produced a progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Encryption,
    Upload,
    Download,
    Decryption,
}

impl Stage {
    /// Direction the stage belongs to
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Encryption | Self::Upload => Direction::Upload,
            Self::Download | Self::Decryption => Direction::Download,
        }
    }
}

/// Identity of a job across both job tables
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobKey {
    /// Upload jobs carry an auto-assigned id
    Upload { id: i64 },
    /// Download jobs are keyed by content and user
    Download { content_id: String, user_id: String },
}

impl JobKey {
    /// Key for an upload job
    #[must_use]
    pub fn upload(id: i64) -> Self {
        Self::Upload { id }
    }

    /// Key for a download job
    #[must_use]
    pub fn download(content_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::Download {
            content_id: content_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Direction of the job this key names
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Upload { .. } => Direction::Upload,
            Self::Download { .. } => Direction::Download,
        }
    }

    /// Name of the lease guarding this job across instances
    #[must_use]
    pub fn lease_name(&self) -> String {
        match self {
            Self::Upload { id } => format!("upload:{id}"),
            Self::Download {
                content_id,
                user_id,
            } => format!("download:{user_id}:{content_id}"),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload { id } => write!(f, "upload#{id}"),
            Self::Download { content_id, .. } => write!(f, "download#{content_id}"),
        }
    }
}

/// A progress report from an active stage
///
/// A failed stage reports `done = true` with no `content_id`; a successful one
/// reports `done = true` with the content identifier it produced or consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub stage: Stage,
    pub job: JobKey,
    pub position: u64,
    pub total: u64,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

impl TransferProgress {
    /// Progress as a percentage (0.0 to 100.0)
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            if self.done { 100.0 } else { 0.0 }
        } else {
            (self.position as f64 / self.total as f64 * 100.0) as f32
        }
    }

    /// Returns true for a terminal report without a success payload
    pub fn is_failure(&self) -> bool {
        self.done && self.content_id.is_none()
    }
}
