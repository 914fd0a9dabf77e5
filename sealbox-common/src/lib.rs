//! Sealbox Common Library
//!
//! Shared job states, progress payloads and broadcast messages exchanged between
//! the transfer engine and every instance observing its queue.

pub mod message;
pub mod progress;
pub mod state;

pub use message::{Command, ContentReady, CoordinatorUpdate, HubEvent, PendingCommand};
pub use progress::{Direction, JobKey, Stage, TransferProgress};
pub use state::{DownloadState, UploadState};

/// Format tag recorded on every object encrypted by the engine
///
/// Decryption refuses any other tag.
pub const CIPHER_FORMAT: &str = "xchacha20poly1305-stream-v1";

/// Default cap for automatic retries of transient transfer failures
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default cap for add-file command retries
pub const DEFAULT_COMMAND_MAX_RETRIES: u32 = 3;

/// Path segment under which the filehost serves encrypted objects
pub const FILES_PATH: &str = "files";

/// Build the object URL for a content identifier on a filehost
///
/// Trailing slashes on the host are ignored so that configured hosts with or
/// without one produce the same URL.
#[must_use]
pub fn object_url(host_url: &str, content_id: &str) -> String {
    format!(
        "{}/{}/{}",
        host_url.trim_end_matches('/'),
        FILES_PATH,
        content_id
    )
}

/// Build the part URL for an upload at a byte position
#[must_use]
pub fn part_url(host_url: &str, content_id: &str, position: u64) -> String {
    format!("{}/{}", object_url(host_url, content_id), position)
}
