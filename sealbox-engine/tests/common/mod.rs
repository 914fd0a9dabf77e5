//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;

use sealbox_common::{CIPHER_FORMAT, DownloadState, PendingCommand, UploadState};
use sealbox_engine::clock::Clock;
use sealbox_engine::crypto::{SecretKey, StaticKeyProvider, StreamHeader};
use sealbox_engine::db::{Database, DownloadJob, EncryptionResult, NewUpload, UploadJob};
use sealbox_engine::host::{DownloadResponse, FileHost, HostError, ResponseKind};
use sealbox_engine::{DecryptMode, Engine, EngineConfig, SystemClock};

pub const HOST_URL: &str = "http://filehost.test";

pub const USER: &str = "alice";

/// Body chunk size of fake download responses
const BODY_CHUNK: usize = 16 * 1024;

pub fn test_key() -> SecretKey {
    SecretKey::from_bytes([7u8; 32])
}

/// Config rooted in `dir` with short intervals
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: Some(dir.to_path_buf()),
        user_id: USER.to_string(),
        filehost_url: Some(HOST_URL.to_string()),
        key: Some(test_key().to_hex()),
        maintenance_interval_secs: 1,
        verify_timeout_ms: 2_000,
        progress_interval_ms: 0,
        decrypt_mode: DecryptMode::Auto,
        ..EngineConfig::default()
    }
}

pub async fn open_db(config: &EngineConfig) -> Database {
    Database::open(&config.database_path().unwrap())
        .await
        .unwrap()
}

pub async fn start_engine(config: EngineConfig, host: Arc<FakeHost>) -> Engine {
    let db = open_db(&config).await;
    Engine::start(
        config,
        db,
        host,
        Arc::new(StaticKeyProvider::new(test_key())),
        Arc::new(SystemClock),
    )
    .await
    .unwrap()
}

/// Deadline for engine-level waits
const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

const POLL: Duration = Duration::from_millis(20);

/// Poll an upload until it reaches `want`
///
/// With `confirm`, pending add-file commands are confirmed along the way.
pub async fn wait_for_upload(
    engine: &Engine,
    id: i64,
    want: UploadState,
    confirm: bool,
) -> UploadJob {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if confirm {
            confirm_commands(engine);
        }
        let job = engine.upload(id).await.unwrap();
        if let Some(job) = job.as_ref()
            && job.state == want
        {
            return job.clone();
        }
        if Instant::now() > deadline {
            panic!(
                "upload {id} never reached {want}, last seen {:?}",
                job.map(|j| (j.state, j.error))
            );
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Poll a download until it reaches `want`
pub async fn wait_for_download(
    engine: &Engine,
    content_id: &str,
    want: DownloadState,
) -> DownloadJob {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let job = engine.download(content_id).await.unwrap();
        if let Some(job) = job.as_ref()
            && job.state == want
        {
            return job.clone();
        }
        if Instant::now() > deadline {
            panic!(
                "download {content_id} never reached {want}, last seen {:?}",
                job.map(|j| (j.state, j.error))
            );
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Poll until the upload job is gone
pub async fn wait_for_upload_removed(engine: &Engine, id: i64) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while engine.upload(id).await.unwrap().is_some() {
        assert!(Instant::now() < deadline, "upload {id} was never removed");
        tokio::time::sleep(POLL).await;
    }
}

/// Consume add-file commands until at least one shows up
pub async fn next_commands(engine: &Engine) -> Vec<PendingCommand> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let commands = engine.consume_commands();
        if !commands.is_empty() {
            return commands;
        }
        assert!(Instant::now() < deadline, "no add-file command published");
        tokio::time::sleep(POLL).await;
    }
}

/// Deterministic test content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Insert an upload already split into `parts` stored parts of `part_len` bytes
/// and move it to `uploading`
///
/// Part contents are not real ciphertext; only the upload stage touches them.
pub async fn insert_uploading_job(
    db: &Database,
    content_id: &str,
    parts: u64,
    part_len: u64,
) -> i64 {
    let job = db
        .uploads
        .insert(
            &NewUpload {
                user_id: USER.to_string(),
                source_path: "/tmp/big.bin".into(),
                directory: "/".to_string(),
                display_path: "big.bin".to_string(),
                clear_size: parts * part_len,
            },
            SystemClock.now_millis(),
        )
        .await
        .unwrap();
    let id = job.id;
    let key = job.key();

    for n in 0..parts {
        db.parts
            .put(&key, n * part_len, &vec![n as u8; part_len as usize])
            .await
            .unwrap();
    }

    assert!(db.uploads.transition(id, UploadState::Initial, UploadState::Encrypting).await.unwrap());
    assert!(
        db.uploads
            .finish_encryption(
                id,
                &EncryptionResult {
                    encrypted_size: parts * part_len,
                    content_id: content_id.to_string(),
                    format: CIPHER_FORMAT.to_string(),
                    nonce: StreamHeader::random().to_hex(),
                },
            )
            .await
            .unwrap()
    );
    assert!(db.uploads.transition(id, UploadState::Generating, UploadState::SendCommand).await.unwrap());
    assert!(db.uploads.assign_host(id, HOST_URL).await.unwrap());
    assert!(db.uploads.transition(id, UploadState::Ready, UploadState::Uploading).await.unwrap());
    id
}

/// Confirm every pending add-file command against the test host
pub fn confirm_commands(engine: &Engine) -> usize {
    let commands = engine.consume_commands();
    for command in &commands {
        engine.confirm_command(command.job_id, HOST_URL).unwrap();
    }
    commands.len()
}

// =============================================================================
// Fake Filehost
// =============================================================================

/// In-memory filehost recording every request
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    /// Uploaded parts per content id
    parts: HashMap<String, BTreeMap<u64, Vec<u8>>>,
    finalized: HashSet<String>,
    /// Objects served for download, by URL
    objects: HashMap<String, Vec<u8>>,
    puts: Vec<(String, u64)>,
    gets: Vec<(String, u64)>,
    /// Fail the put with this sequence number (1-based) once
    fail_put: Option<usize>,
    put_delay: Option<Duration>,
    finalize_delay: Option<Duration>,
    /// Answer ranged requests with a full 200 response
    ignore_range: bool,
    /// Refuse every download request with a transport error
    fail_gets: bool,
    /// Drop the next download body after this many bytes
    cut_body_at: Option<usize>,
    /// Pause before each download body chunk
    chunk_delay: Option<Duration>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    /// Serve `data` for GET requests to `url`
    pub fn serve(&self, url: &str, data: Vec<u8>) {
        self.state().objects.insert(url.to_string(), data);
    }

    pub fn fail_put_number(&self, n: usize) {
        self.state().fail_put = Some(n);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        self.state().put_delay = Some(delay);
    }

    pub fn set_finalize_delay(&self, delay: Duration) {
        self.state().finalize_delay = Some(delay);
    }

    pub fn ignore_range(&self) {
        self.state().ignore_range = true;
    }

    pub fn fail_gets(&self) {
        self.state().fail_gets = true;
    }

    /// Break the next download body with a transport error after `len` bytes
    pub fn cut_next_body_at(&self, len: usize) {
        self.state().cut_body_at = Some(len);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        self.state().chunk_delay = Some(delay);
    }

    /// Positions of every accepted or attempted part upload, in order
    pub fn puts(&self) -> Vec<(String, u64)> {
        self.state().puts.clone()
    }

    /// URL and start position of every download request
    pub fn gets(&self) -> Vec<(String, u64)> {
        self.state().gets.clone()
    }

    pub fn is_finalized(&self, content_id: &str) -> bool {
        self.state().finalized.contains(content_id)
    }

    /// Uploaded object reassembled from its parts
    pub fn object(&self, content_id: &str) -> Vec<u8> {
        self.state()
            .parts
            .get(content_id)
            .map(|parts| parts.values().flatten().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FileHost for FakeHost {
    async fn put_part(
        &self,
        _host_url: &str,
        content_id: &str,
        position: u64,
        data: Bytes,
    ) -> Result<(), HostError> {
        let delay = {
            let mut state = self.state();
            state.puts.push((content_id.to_string(), position));
            if state.fail_put == Some(state.puts.len()) {
                state.fail_put = None;
                return Err(HostError::Transport("connection reset".to_string()));
            }
            state.put_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state()
            .parts
            .entry(content_id.to_string())
            .or_default()
            .insert(position, data.to_vec());
        Ok(())
    }

    async fn finalize(&self, _host_url: &str, content_id: &str) -> Result<(), HostError> {
        let delay = self.state().finalize_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if !state.parts.contains_key(content_id) {
            return Err(HostError::Status(404));
        }
        state.finalized.insert(content_id.to_string());
        Ok(())
    }

    async fn open_download(&self, url: &str, from: u64) -> Result<DownloadResponse, HostError> {
        let mut state = self.state();
        state.gets.push((url.to_string(), from));
        if state.fail_gets {
            return Err(HostError::Transport("connection refused".to_string()));
        }
        let data = state.objects.get(url).cloned().ok_or(HostError::Status(404))?;

        let (kind, mut body) = if from > 0 && !state.ignore_range {
            let start = (from as usize).min(data.len());
            (ResponseKind::Partial { start: from }, data[start..].to_vec())
        } else {
            (ResponseKind::Full, data.clone())
        };

        let cut = state.cut_body_at.take();
        if let Some(len) = cut {
            body.truncate(len);
        }
        let mut chunks: Vec<Result<Bytes, HostError>> = body
            .chunks(BODY_CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if cut.is_some() {
            chunks.push(Err(HostError::Transport("connection reset".to_string())));
        }

        let delay = state.chunk_delay;
        let body = stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            chunk
        });
        Ok(DownloadResponse {
            kind,
            total: Some(data.len() as u64),
            body: body.boxed(),
        })
    }
}
