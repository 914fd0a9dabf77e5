//! Sealbox transfer engine
//!
//! Resumable end-to-end encrypted file transfers. Uploads are encrypted into
//! parts held in a local job store and pushed to a filehost part by part;
//! downloads are fetched with range requests into a local buffer and decrypted
//! once complete. Every step persists enough state to resume after a restart,
//! and several engine instances can share one store.
//!
//! ## Module Structure
//!
//! - `config` - Engine settings and their JSON file
//! - `db` - SQLite job store: jobs, parts and leases
//! - `crypto` - Chunked XChaCha20-Poly1305 stream cipher
//! - `host` - Filehost client
//! - `transfers` - The four pipeline stages
//! - `coordinator` - Per-direction scheduling tasks
//! - `hub` - Fan-out of coordinator updates to listeners
//! - `engine` - Wiring of one engine instance

pub mod clock;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod host;
pub mod hub;
pub mod transfers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DecryptMode, EngineConfig};
pub use engine::{DownloadRequest, Engine};
pub use error::{EngineError, Result, StageError};
pub use host::{FileHost, HostError, HttpFileHost};
pub use hub::{BroadcastHub, ChannelListener, HubListener, ListenerId};
