//! Error types shared by the store, the stages and the coordinators

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::host::HostError;

/// Failures of the store, the filesystem or the configuration
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("config error: {0}")]
    Config(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid transition for {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },

    #[error("corrupt job record {job}: {reason}")]
    CorruptRecord { job: String, reason: String },

    #[error("engine stopped")]
    Stopped,
}

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome classes of a stage run
///
/// The coordinator maps each class to the state the job is left in.
#[derive(Debug, Error)]
pub enum StageError {
    /// Connection drop or timeout; retried automatically up to the cap
    #[error("transient network error: {0}")]
    Transient(String),

    /// Unexpected status or size mismatch; never retried automatically
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unsupported format, missing key or failed authentication
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The stage observed its cancel flag
    #[error("cancelled")]
    Cancelled,

    /// Another instance holds the lease the stage needs
    #[error("busy")]
    Busy,

    /// The job left the stage's input state before the stage could start
    #[error("job moved on")]
    Skipped,

    /// A stage invariant was violated
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<HostError> for StageError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Transport(msg) => Self::Transient(msg),
            HostError::Timeout => Self::Transient("request timed out".to_string()),
            HostError::Status(status) => Self::Protocol(format!("unexpected status {status}")),
            HostError::InvalidResponse(msg) => Self::Protocol(msg),
        }
    }
}

impl From<CryptoError> for StageError {
    fn from(err: CryptoError) -> Self {
        Self::Engine(EngineError::Crypto(err))
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::Engine(EngineError::Io(err))
    }
}

impl From<sqlx::Error> for StageError {
    fn from(err: sqlx::Error) -> Self {
        Self::Engine(EngineError::Db(err))
    }
}

impl StageError {
    /// Returns true if an automatic retry may fix the failure
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
