//! Application-wide constants
//!
//! Shared constants used across multiple modules.

use std::time::Duration;

/// Application directory name (used in config and data directory paths)
pub const APP_DIR_NAME: &str = "sealbox";

/// Config file name
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Job store file name inside the data directory
pub const DATABASE_FILE_NAME: &str = "sealbox.db";

/// Directory under the data directory holding downloaded ciphertext
pub const DOWNLOADS_DIR_NAME: &str = "downloads";

/// Directory under the data directory holding decrypted output
pub const FILES_DIR_NAME: &str = "files";

/// Extension of a download buffer file while it still holds ciphertext
pub const CIPHERTEXT_SUFFIX: &str = "enc";

/// Name of the lease serializing decryption across instances
pub const DECRYPT_LEASE: &str = "decrypt";

/// Minimum interval between progress updates (100ms = 10 updates/second)
pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Channel size for listener event queues
pub const LISTENER_CHANNEL_SIZE: usize = 256;
