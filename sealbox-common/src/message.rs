//! Messages exchanged with coordinators and the broadcast hub
//!
//! Every type here has a stable JSON form so that an instance living in
//! another process can relay it over any byte channel.

use serde::{Deserialize, Serialize};

use crate::progress::{Direction, JobKey, TransferProgress};

// =============================================================================
// Coordinator Commands
// =============================================================================

/// Control message delivered to a coordinator task
///
/// Job creation happens in the store before the matching `Enqueued` command is
/// sent, so no command needs a reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// A job was written to the store and is waiting for its first stage
    Enqueued { job: JobKey },
    /// Stop the job and leave it paused
    Pause { job: JobKey },
    /// Move a paused or failed job back into the queue
    Resume { job: JobKey },
    /// Abort the job; with `delete` the job and its parts are removed
    Cancel { job: JobKey, delete: bool },
    /// The filehost accepted the add-file command for an upload
    CommandSent { job_id: i64, host_url: String },
    /// Sending the add-file command failed
    CommandFailed { job_id: i64 },
    /// An out-of-band signal confirmed the object is present on the filehost
    Verified { content_id: String },
    /// Re-run job selection now
    Wake,
    /// Stop the coordinator task
    Shutdown,
}

// =============================================================================
// Hub Payloads
// =============================================================================

/// Upload waiting for the remote add-file command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub job_id: i64,
    pub user_id: String,
    pub content_id: String,
    pub encrypted_size: u64,
    pub directory: String,
    pub display_path: String,
    pub format: String,
    pub nonce: String,
}

/// Download finished and flagged for automatic opening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentReady {
    pub content_id: String,
    pub user_id: String,
    pub output_path: String,
}

/// State update emitted by a coordinator
///
/// `list_changed` is kept apart from `progress` so observers can throttle
/// expensive list refreshes independently of progress bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorUpdate {
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,
    #[serde(default)]
    pub list_changed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands_needed: Vec<PendingCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready: Vec<ContentReady>,
}

impl CoordinatorUpdate {
    /// Update carrying only a progress report
    #[must_use]
    pub fn progress(progress: TransferProgress) -> Self {
        Self {
            direction: progress.stage.direction(),
            progress: Some(progress),
            list_changed: false,
            commands_needed: Vec::new(),
            ready: Vec::new(),
        }
    }

    /// Update announcing that the job list changed
    #[must_use]
    pub fn list_changed(direction: Direction) -> Self {
        Self {
            direction,
            progress: None,
            list_changed: true,
            commands_needed: Vec::new(),
            ready: Vec::new(),
        }
    }
}

/// Event delivered to hub listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Progress { progress: TransferProgress },
    ListChanged { direction: Direction },
}

impl HubEvent {
    /// Encode as a single JSON line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from a JSON line
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Stage;

    #[test]
    fn test_command_wire_form() {
        let cmd = Command::Cancel {
            job: JobKey::upload(9),
            delete: true,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(
            json,
            r#"{"type":"cancel","job":{"kind":"upload","id":9},"delete":true}"#
        );
        assert_eq!(serde_json::from_str::<Command>(&json).unwrap(), cmd);
    }

    #[test]
    fn test_unit_command_wire_form() {
        assert_eq!(serde_json::to_string(&Command::Wake).unwrap(), r#"{"type":"wake"}"#);
    }

    #[test]
    fn test_hub_event_line() {
        let event = HubEvent::Progress {
            progress: TransferProgress {
                stage: Stage::Download,
                job: JobKey::download("c1", "u1"),
                position: 10,
                total: 20,
                done: false,
                content_id: None,
            },
        };
        let line = event.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(HubEvent::from_line(&format!("{line}\n")).unwrap(), event);
    }

    #[test]
    fn test_update_omits_empty_collections() {
        let update = CoordinatorUpdate::list_changed(Direction::Upload);
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"direction":"upload","list_changed":true}"#);
    }
}
