//! SQL query constants for database operations
//!
//! This module contains all SQL queries used by the job store.
//! Each query is documented with its parameters and special behaviors.
//!
//! State changes always carry the expected current state in their `WHERE`
//! clause, so a write racing with another instance affects zero rows instead
//! of clobbering the newer state.

// ========================================================================
// Upload Job Operations
// ========================================================================

/// Columns selected for an upload job, in `UploadRow` order
macro_rules! upload_columns {
    () => {
        "id, user_id, state, enqueued_at, source_path, directory, display_path, clear_size, \
         encrypted_size, position, retries, command_retries, host_url, content_id, format, \
         nonce, error"
    };
}

/// Insert a new upload job
///
/// **Parameters:**
/// 1. `user_id: &str`
/// 2. `state: &str` - Always `initial`
/// 3. `enqueued_at: i64` - Milliseconds since the epoch
/// 4. `source_path: &str`
/// 5. `directory: &str`
/// 6. `display_path: &str`
/// 7. `clear_size: i64`
pub const SQL_INSERT_UPLOAD: &str = "INSERT INTO uploads (user_id, state, enqueued_at, source_path, directory, display_path, clear_size) VALUES (?, ?, ?, ?, ?, ?, ?)";

/// Select an upload job by id
///
/// **Parameters:**
/// 1. `id: i64`
pub const SQL_SELECT_UPLOAD: &str = concat!("SELECT ", upload_columns!(), " FROM uploads WHERE id = ?");

/// Select all upload jobs of a user, oldest first
///
/// **Parameters:**
/// 1. `user_id: &str`
pub const SQL_SELECT_UPLOADS_FOR_USER: &str = concat!(
    "SELECT ",
    upload_columns!(),
    " FROM uploads WHERE user_id = ? ORDER BY enqueued_at, id"
);

/// Select upload jobs of a user in one state, oldest first
///
/// **Parameters:**
/// 1. `user_id: &str`
/// 2. `state: &str`
///
/// **Note:** Served by the `(user_id, state, enqueued_at)` index.
pub const SQL_SELECT_UPLOADS_IN_STATE: &str = concat!(
    "SELECT ",
    upload_columns!(),
    " FROM uploads WHERE user_id = ? AND state = ? ORDER BY enqueued_at, id"
);

/// Select upload jobs in one state for every user
///
/// **Parameters:**
/// 1. `state: &str`
pub const SQL_SELECT_UPLOADS_IN_STATE_ALL_USERS: &str = concat!(
    "SELECT ",
    upload_columns!(),
    " FROM uploads WHERE state = ? ORDER BY enqueued_at, id"
);

/// Select upload jobs carrying a content identifier
///
/// **Parameters:**
/// 1. `content_id: &str`
pub const SQL_SELECT_UPLOADS_BY_CONTENT: &str = concat!(
    "SELECT ",
    upload_columns!(),
    " FROM uploads WHERE content_id = ? ORDER BY id"
);

/// Compare-and-set the state of an upload job
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `id: i64`
/// 3. `expected_state: &str`
pub const SQL_TRANSITION_UPLOAD: &str = "UPDATE uploads SET state = ? WHERE id = ? AND state = ?";

/// Record the results of encryption and move to `generating`
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `encrypted_size: i64`
/// 3. `content_id: &str`
/// 4. `format: &str`
/// 5. `nonce: &str` - Hex stream header
/// 6. `id: i64`
/// 7. `expected_state: &str`
///
/// **Note:** Also resets the upload position to zero.
pub const SQL_FINISH_ENCRYPTION: &str = "UPDATE uploads SET state = ?, encrypted_size = ?, content_id = ?, format = ?, nonce = ?, position = 0, error = NULL WHERE id = ? AND state = ?";

/// Assign the filehost after the add-file command was sent
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `host_url: &str`
/// 3. `id: i64`
/// 4. `expected_state: &str`
pub const SQL_ASSIGN_UPLOAD_HOST: &str =
    "UPDATE uploads SET state = ?, host_url = ? WHERE id = ? AND state = ?";

/// Count one failed add-file command
///
/// **Parameters:**
/// 1. `id: i64`
/// 2. `expected_state: &str`
pub const SQL_BUMP_COMMAND_RETRIES: &str =
    "UPDATE uploads SET command_retries = command_retries + 1 WHERE id = ? AND state = ?";

/// Persist the upload byte position
///
/// **Parameters:**
/// 1. `position: i64`
/// 2. `id: i64`
/// 3. `expected_state: &str`
/// 4. `position: i64` - Same value again
///
/// **Note:** The position never moves backwards.
pub const SQL_SET_UPLOAD_POSITION: &str =
    "UPDATE uploads SET position = ? WHERE id = ? AND state = ? AND position <= ?";

/// Move an upload job to an error state and record the message
///
/// **Parameters:**
/// 1. `new_state: &str` - `error` or `error_during_part_upload`
/// 2. `error: &str`
/// 3. `id: i64`
/// 4. `expected_state: &str`
pub const SQL_MARK_UPLOAD_ERROR: &str =
    "UPDATE uploads SET state = ?, error = ? WHERE id = ? AND state = ?";

/// Requeue an upload job after a transient failure
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `enqueued_at: i64` - Moves the job to the back of the queue
/// 3. `id: i64`
/// 4. `expected_state: &str`
pub const SQL_REQUEUE_UPLOAD: &str = "UPDATE uploads SET state = ?, retries = retries + 1, enqueued_at = ?, error = NULL WHERE id = ? AND state = ?";

/// Requeue an upload job on user request, clearing the retry budget
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `enqueued_at: i64`
/// 3. `id: i64`
/// 4. `expected_state: &str`
pub const SQL_RESUME_UPLOAD: &str = "UPDATE uploads SET state = ?, retries = 0, enqueued_at = ?, error = NULL WHERE id = ? AND state = ?";

/// Forget encryption results so the job is encrypted again
///
/// **Parameters:**
/// 1. `new_state: &str` - Always `initial`
/// 2. `enqueued_at: i64`
/// 3. `id: i64`
/// 4. `expected_state: &str`
pub const SQL_RESET_UPLOAD_FOR_ENCRYPTION: &str = "UPDATE uploads SET state = ?, encrypted_size = NULL, content_id = NULL, format = NULL, nonce = NULL, host_url = NULL, position = 0, command_retries = 0, error = NULL, enqueued_at = ? WHERE id = ? AND state = ?";

/// Delete an upload job
///
/// **Parameters:**
/// 1. `id: i64`
pub const SQL_DELETE_UPLOAD: &str = "DELETE FROM uploads WHERE id = ?";

// ========================================================================
// Download Job Operations
// ========================================================================

/// Columns selected for a download job, in `DownloadRow` order
macro_rules! download_columns {
    () => {
        "content_id, user_id, state, enqueued_at, locations, position, encrypted_size, format, \
         key, nonce, retries, output_path, auto_open, retryable, error"
    };
}

/// Insert a download job unless one already exists for the key
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
/// 3. `state: &str` - Always `initial`
/// 4. `enqueued_at: i64`
/// 5. `locations: &str` - JSON object of host URL to last-seen millis
/// 6. `encrypted_size: Option<i64>`
/// 7. `format: &str`
/// 8. `key: &str` - Hex key
/// 9. `nonce: &str` - Hex stream header
/// 10. `output_path: &str`
/// 11. `auto_open: bool`
///
/// **Note:** Affects zero rows when the job already exists.
pub const SQL_INSERT_DOWNLOAD: &str = "INSERT INTO downloads (content_id, user_id, state, enqueued_at, locations, encrypted_size, format, key, nonce, output_path, auto_open) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(content_id, user_id) DO NOTHING";

/// Select a download job by key
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
pub const SQL_SELECT_DOWNLOAD: &str = concat!(
    "SELECT ",
    download_columns!(),
    " FROM downloads WHERE content_id = ? AND user_id = ?"
);

/// Select all download jobs of a user, oldest first
///
/// **Parameters:**
/// 1. `user_id: &str`
pub const SQL_SELECT_DOWNLOADS_FOR_USER: &str = concat!(
    "SELECT ",
    download_columns!(),
    " FROM downloads WHERE user_id = ? ORDER BY enqueued_at, content_id"
);

/// Select download jobs of a user in one state, oldest first
///
/// **Parameters:**
/// 1. `user_id: &str`
/// 2. `state: &str`
pub const SQL_SELECT_DOWNLOADS_IN_STATE: &str = concat!(
    "SELECT ",
    download_columns!(),
    " FROM downloads WHERE user_id = ? AND state = ? ORDER BY enqueued_at, content_id"
);

/// Compare-and-set the state of a download job
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `content_id: &str`
/// 3. `user_id: &str`
/// 4. `expected_state: &str`
pub const SQL_TRANSITION_DOWNLOAD: &str =
    "UPDATE downloads SET state = ? WHERE content_id = ? AND user_id = ? AND state = ?";

/// Persist the download byte position
///
/// **Parameters:**
/// 1. `position: i64`
/// 2. `content_id: &str`
/// 3. `user_id: &str`
/// 4. `expected_state: &str`
/// 5. `position: i64` - Same value again
///
/// **Note:** The position never moves backwards; use
/// `SQL_RESET_DOWNLOAD_POSITION` to restart from zero.
pub const SQL_SET_DOWNLOAD_POSITION: &str = "UPDATE downloads SET position = ? WHERE content_id = ? AND user_id = ? AND state = ? AND position <= ?";

/// Restart a download from byte zero
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
/// 3. `expected_state: &str`
pub const SQL_RESET_DOWNLOAD_POSITION: &str =
    "UPDATE downloads SET position = 0 WHERE content_id = ? AND user_id = ? AND state = ?";

/// Replace the known locations of a download
///
/// **Parameters:**
/// 1. `locations: &str` - JSON object
/// 2. `content_id: &str`
/// 3. `user_id: &str`
pub const SQL_SET_DOWNLOAD_LOCATIONS: &str =
    "UPDATE downloads SET locations = ? WHERE content_id = ? AND user_id = ?";

/// Record a completed transfer and move to `encrypted`
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `position: i64`
/// 3. `encrypted_size: i64`
/// 4. `content_id: &str`
/// 5. `user_id: &str`
/// 6. `expected_state: &str`
pub const SQL_FINISH_DOWNLOAD: &str = "UPDATE downloads SET state = ?, position = ?, encrypted_size = ?, error = NULL WHERE content_id = ? AND user_id = ? AND state = ?";

/// Move a download job to `error`
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `error: &str`
/// 3. `retryable: bool`
/// 4. `content_id: &str`
/// 5. `user_id: &str`
/// 6. `expected_state: &str`
pub const SQL_MARK_DOWNLOAD_ERROR: &str = "UPDATE downloads SET state = ?, error = ?, retryable = ? WHERE content_id = ? AND user_id = ? AND state = ?";

/// Requeue a download job after a retryable failure
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `enqueued_at: i64`
/// 3. `content_id: &str`
/// 4. `user_id: &str`
/// 5. `expected_state: &str`
pub const SQL_REQUEUE_DOWNLOAD: &str = "UPDATE downloads SET state = ?, retries = retries + 1, enqueued_at = ?, retryable = 0, error = NULL WHERE content_id = ? AND user_id = ? AND state = ?";

/// Requeue a download job on user request, clearing the retry budget
///
/// **Parameters:**
/// 1. `new_state: &str`
/// 2. `enqueued_at: i64`
/// 3. `content_id: &str`
/// 4. `user_id: &str`
/// 5. `expected_state: &str`
pub const SQL_RESUME_DOWNLOAD: &str = "UPDATE downloads SET state = ?, retries = 0, enqueued_at = ?, retryable = 0, error = NULL WHERE content_id = ? AND user_id = ? AND state = ?";

/// Demote a download whose decryption failed
///
/// **Parameters:**
/// 1. `new_state: &str` - Always `paused`
/// 2. `error: &str`
/// 3. `content_id: &str`
/// 4. `user_id: &str`
/// 5. `expected_state: &str`
///
/// **Note:** The ciphertext file is deleted by the caller, so the position
/// restarts at zero.
pub const SQL_DEMOTE_DOWNLOAD: &str = "UPDATE downloads SET state = ?, position = 0, error = ? WHERE content_id = ? AND user_id = ? AND state = ?";

/// Mark a download decrypted and erase its key
///
/// **Parameters:**
/// 1. `new_state: &str` - Always `done`
/// 2. `content_id: &str`
/// 3. `user_id: &str`
/// 4. `expected_state: &str`
pub const SQL_FINISH_DECRYPTION: &str = "UPDATE downloads SET state = ?, key = NULL, error = NULL WHERE content_id = ? AND user_id = ? AND state = ?";

/// Delete a download job
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
pub const SQL_DELETE_DOWNLOAD: &str = "DELETE FROM downloads WHERE content_id = ? AND user_id = ?";

// ========================================================================
// Part Operations
// ========================================================================

/// Store an upload part
///
/// **Parameters:**
/// 1. `job_id: i64`
/// 2. `position: i64`
/// 3. `data: &[u8]`
///
/// **Note:** Rewriting a part after a restarted encryption replaces it.
pub const SQL_PUT_UPLOAD_PART: &str =
    "INSERT OR REPLACE INTO upload_parts (job_id, position, data) VALUES (?, ?, ?)";

/// First upload part at or after a position
///
/// **Parameters:**
/// 1. `job_id: i64`
/// 2. `position: i64`
///
/// **Returns:** `(position: i64, data: Vec<u8>)`
pub const SQL_NEXT_UPLOAD_PART: &str = "SELECT position, data FROM upload_parts WHERE job_id = ? AND position >= ? ORDER BY position LIMIT 1";

/// Positions and lengths of every upload part
///
/// **Parameters:**
/// 1. `job_id: i64`
///
/// **Returns:** `(position: i64, length: i64)`
pub const SQL_UPLOAD_PART_EXTENTS: &str =
    "SELECT position, length(data) FROM upload_parts WHERE job_id = ? ORDER BY position";

/// Delete every part of an upload job
///
/// **Parameters:**
/// 1. `job_id: i64`
pub const SQL_DELETE_UPLOAD_PARTS: &str = "DELETE FROM upload_parts WHERE job_id = ?";

/// Store a download part
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
/// 3. `position: i64`
/// 4. `data: &[u8]`
pub const SQL_PUT_DOWNLOAD_PART: &str = "INSERT OR REPLACE INTO download_parts (content_id, user_id, position, data) VALUES (?, ?, ?, ?)";

/// First download part at or after a position
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
/// 3. `position: i64`
///
/// **Returns:** `(position: i64, data: Vec<u8>)`
pub const SQL_NEXT_DOWNLOAD_PART: &str = "SELECT position, data FROM download_parts WHERE content_id = ? AND user_id = ? AND position >= ? ORDER BY position LIMIT 1";

/// Positions and lengths of every download part
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
///
/// **Returns:** `(position: i64, length: i64)`
pub const SQL_DOWNLOAD_PART_EXTENTS: &str = "SELECT position, length(data) FROM download_parts WHERE content_id = ? AND user_id = ? ORDER BY position";

/// Delete every part of a download job
///
/// **Parameters:**
/// 1. `content_id: &str`
/// 2. `user_id: &str`
pub const SQL_DELETE_DOWNLOAD_PARTS: &str =
    "DELETE FROM download_parts WHERE content_id = ? AND user_id = ?";

// ========================================================================
// Lease Operations
// ========================================================================

/// Take a lease if it is free, expired or already ours
///
/// **Parameters:**
/// 1. `name: &str`
/// 2. `owner: &str`
/// 3. `expires_at: i64`
/// 4. `now: i64`
///
/// **Note:** Affects zero rows when another owner holds an unexpired lease.
/// Taking a lease we already hold extends it.
pub const SQL_ACQUIRE_LEASE: &str = "INSERT INTO leases (name, owner, expires_at) VALUES (?, ?, ?) ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at WHERE leases.expires_at <= ? OR leases.owner = excluded.owner";

/// Release a lease held by an owner
///
/// **Parameters:**
/// 1. `name: &str`
/// 2. `owner: &str`
pub const SQL_RELEASE_LEASE: &str = "DELETE FROM leases WHERE name = ? AND owner = ?";

/// Release every lease held by an owner
///
/// **Parameters:**
/// 1. `owner: &str`
pub const SQL_RELEASE_ALL_LEASES: &str = "DELETE FROM leases WHERE owner = ?";

/// Current holder of an unexpired lease
///
/// **Parameters:**
/// 1. `name: &str`
/// 2. `now: i64`
///
/// **Returns:** `(owner: String)`
pub const SQL_SELECT_LEASE_HOLDER: &str =
    "SELECT owner FROM leases WHERE name = ? AND expires_at > ?";

/// Delete expired leases
///
/// **Parameters:**
/// 1. `now: i64`
pub const SQL_PURGE_EXPIRED_LEASES: &str = "DELETE FROM leases WHERE expires_at <= ?";
