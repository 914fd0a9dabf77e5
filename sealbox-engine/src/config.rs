//! Engine configuration
//!
//! Loaded from `config.json` under the platform config directory. Every field
//! has a default, so a missing or partial file is valid; command-line flags
//! override individual values after loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sealbox_common::{DEFAULT_COMMAND_MAX_RETRIES, DEFAULT_MAX_RETRIES};

use crate::constants::{
    APP_DIR_NAME, CONFIG_FILE_NAME, DATABASE_FILE_NAME, DOWNLOADS_DIR_NAME, FILES_DIR_NAME,
};
use crate::crypto::SecretKey;
use crate::error::{EngineError, Result};

/// User id used when none is configured
pub const DEFAULT_USER_ID: &str = "local";

/// How often maintenance re-runs job selection
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// How long the finalize call may take before verification moves to the background
pub const DEFAULT_VERIFY_TIMEOUT_MS: u64 = 3_000;

/// How long a hub listener may take before it is evicted
pub const DEFAULT_LISTENER_TIMEOUT_MS: u64 = 1_000;

/// Lifetime of a lease that is not renewed
pub const DEFAULT_LEASE_TTL_SECS: u64 = 120;

/// Per-request timeout for filehost calls without a body stream
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Decryption strategy selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DecryptMode {
    /// Probe the downloads directory once and pick in-place when it works
    #[default]
    Auto,
    /// Rewrite the ciphertext file in place
    InPlace,
    /// Write cleartext to a new file
    Copy,
}

/// Engine settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for the job store, downloads and decrypted files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// User whose queue this instance serves
    pub user_id: String,

    /// Filehost receiving uploads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filehost_url: Option<String>,

    /// Collection key as hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub max_retries: u32,
    pub command_max_retries: u32,
    pub maintenance_interval_secs: u64,
    pub verify_timeout_ms: u64,
    pub listener_timeout_ms: u64,
    pub lease_ttl_secs: u64,
    pub progress_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub decrypt_mode: DecryptMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            user_id: DEFAULT_USER_ID.to_string(),
            filehost_url: None,
            key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            command_max_retries: DEFAULT_COMMAND_MAX_RETRIES,
            maintenance_interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
            verify_timeout_ms: DEFAULT_VERIFY_TIMEOUT_MS,
            listener_timeout_ms: DEFAULT_LISTENER_TIMEOUT_MS,
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            progress_interval_ms: crate::constants::PROGRESS_UPDATE_INTERVAL.as_millis() as u64,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            decrypt_mode: DecryptMode::Auto,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("data_dir", &self.data_dir)
            .field("user_id", &self.user_id)
            .field("filehost_url", &self.filehost_url)
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("max_retries", &self.max_retries)
            .field("command_max_retries", &self.command_max_retries)
            .field("maintenance_interval_secs", &self.maintenance_interval_secs)
            .field("verify_timeout_ms", &self.verify_timeout_ms)
            .field("listener_timeout_ms", &self.listener_timeout_ms)
            .field("lease_ttl_secs", &self.lease_ttl_secs)
            .field("progress_interval_ms", &self.progress_interval_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("decrypt_mode", &self.decrypt_mode)
            .finish()
    }
}

impl EngineConfig {
    /// Platform-specific config file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from the platform config file, falling back to defaults if it does not exist
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    /// Write as pretty JSON, creating the parent directory
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR_NAME))
                .ok_or_else(|| EngineError::Config("no platform data directory".to_string())),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DATABASE_FILE_NAME))
    }

    /// Directory holding download buffer files
    pub fn downloads_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DOWNLOADS_DIR_NAME))
    }

    /// Default directory for decrypted output
    pub fn files_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(FILES_DIR_NAME))
    }

    /// Parsed collection key, if one is configured
    pub fn secret_key(&self) -> Result<Option<SecretKey>> {
        self.key
            .as_deref()
            .map(SecretKey::from_hex)
            .transpose()
            .map_err(EngineError::from)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    /// Lease lifetime in milliseconds
    pub fn lease_ttl_millis(&self) -> i64 {
        (self.lease_ttl_secs as i64).saturating_mul(1_000)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
