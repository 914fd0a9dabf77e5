//! HTTP filehost client against a local axum filehost

mod common;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{post, put};
use futures_util::StreamExt;

use sealbox_common::{CIPHER_FORMAT, DownloadState, UploadState, object_url};
use sealbox_engine::crypto::StaticKeyProvider;
use sealbox_engine::host::{DownloadResponse, FileHost, HostError, HttpFileHost, ResponseKind};
use sealbox_engine::{DownloadRequest, Engine, SystemClock};

use common::{
    next_commands, open_db, pattern, test_config, test_key, wait_for_download, wait_for_upload,
};

// =============================================================================
// Local filehost
// =============================================================================

#[derive(Default)]
struct Stored {
    parts: HashMap<String, BTreeMap<u64, Vec<u8>>>,
}

impl Stored {
    fn object(&self, content_id: &str) -> Option<Vec<u8>> {
        self.parts
            .get(content_id)
            .map(|parts| parts.values().flatten().copied().collect())
    }
}

type Shared = Arc<Mutex<Stored>>;

async fn put_part(
    State(state): State<Shared>,
    Path((content_id, position)): Path<(String, u64)>,
    body: Bytes,
) -> StatusCode {
    state
        .lock()
        .unwrap()
        .parts
        .entry(content_id)
        .or_default()
        .insert(position, body.to_vec());
    StatusCode::OK
}

async fn finalize(State(state): State<Shared>, Path(content_id): Path<String>) -> StatusCode {
    if state.lock().unwrap().parts.contains_key(&content_id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Serve an object, honouring `Range: bytes={start}-`
async fn download(
    State(state): State<Shared>,
    Path(content_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(data) = state.lock().unwrap().object(&content_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let start = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.strip_suffix('-'))
        .and_then(|value| value.parse::<usize>().ok());

    match start {
        Some(start) if start < data.len() => {
            let range = format!("bytes {start}-{}/{}", data.len() - 1, data.len());
            (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, range)],
                data[start..].to_vec(),
            )
                .into_response()
        }
        Some(_) => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => (StatusCode::OK, data).into_response(),
    }
}

/// Start a filehost on a free port and return its base URL
async fn spawn_filehost() -> (String, Shared) {
    let state: Shared = Arc::default();
    let app = Router::new()
        .route("/files/{content_id}/{position}", put(put_part))
        .route("/files/{content_id}", post(finalize).get(download))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn client() -> HttpFileHost {
    HttpFileHost::new(Duration::from_secs(10)).unwrap()
}

async fn read_body(response: DownloadResponse) -> Vec<u8> {
    let mut body = response.body;
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    data
}

// =============================================================================
// Client
// =============================================================================

#[tokio::test]
async fn test_parts_are_stored_at_their_positions() {
    let (base, state) = spawn_filehost().await;
    let host = client();

    host.put_part(&base, "cid-parts", 0, Bytes::from_static(b"hello "))
        .await
        .unwrap();
    host.put_part(&base, "cid-parts", 6, Bytes::from_static(b"world"))
        .await
        .unwrap();
    host.finalize(&base, "cid-parts").await.unwrap();

    let stored = state.lock().unwrap().object("cid-parts").unwrap();
    assert_eq!(stored, b"hello world");
}

#[tokio::test]
async fn test_finalize_unknown_object_reports_status() {
    let (base, _state) = spawn_filehost().await;
    let err = client().finalize(&base, "cid-unknown").await.unwrap_err();
    assert_eq!(err, HostError::Status(404));
}

#[tokio::test]
async fn test_download_full_and_ranged() {
    let (base, _state) = spawn_filehost().await;
    let host = client();
    let data = pattern(300_000);
    host.put_part(&base, "cid-range", 0, Bytes::from(data.clone()))
        .await
        .unwrap();
    let url = object_url(&base, "cid-range");

    let full = host.open_download(&url, 0).await.unwrap();
    assert_eq!(full.kind, ResponseKind::Full);
    assert_eq!(full.total, Some(300_000));
    assert_eq!(read_body(full).await, data);

    let ranged = host.open_download(&url, 120_000).await.unwrap();
    assert_eq!(ranged.kind, ResponseKind::Partial { start: 120_000 });
    assert_eq!(ranged.total, Some(300_000));
    assert_eq!(read_body(ranged).await, &data[120_000..]);
}

#[tokio::test]
async fn test_download_of_missing_object_reports_status() {
    let (base, _state) = spawn_filehost().await;
    let url = object_url(&base, "cid-none");
    let err = client().open_download(&url, 0).await.err().unwrap();
    assert_eq!(err, HostError::Status(404));
}

#[tokio::test]
async fn test_unreachable_host_is_a_transport_error() {
    // Bind and drop a listener to get a port nobody serves
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let err = client()
        .put_part(&format!("http://{addr}"), "cid", 0, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Transport(_)), "unexpected error {err:?}");
}

// =============================================================================
// Engine over HTTP
// =============================================================================

#[tokio::test]
async fn test_engine_round_trip_over_http() {
    let (base, state) = spawn_filehost().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.filehost_url = Some(base.clone());

    let db = open_db(&config).await;
    let engine = Engine::start(
        config,
        db,
        Arc::new(client()),
        Arc::new(StaticKeyProvider::new(test_key())),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();

    let clear = pattern(1_500_000);
    let source = dir.path().join("movie.bin");
    std::fs::write(&source, &clear).unwrap();
    let key = engine.submit_upload(&source, "/").await.unwrap();
    let sealbox_common::JobKey::Upload { id } = key else {
        panic!("expected an upload key");
    };

    for command in next_commands(&engine).await {
        engine.confirm_command(command.job_id, &base).unwrap();
    }
    let uploaded = wait_for_upload(&engine, id, UploadState::Done, false).await;
    let content_id = uploaded.content_id.clone().unwrap();
    assert_eq!(
        state.lock().unwrap().object(&content_id).unwrap().len() as u64,
        uploaded.encrypted_size.unwrap()
    );

    let output = dir.path().join("movie.out");
    engine
        .submit_download(DownloadRequest {
            content_id: content_id.clone(),
            host_url: base.clone(),
            encrypted_size: uploaded.encrypted_size,
            format: CIPHER_FORMAT.to_string(),
            key: test_key().to_hex(),
            nonce: uploaded.nonce.clone().unwrap(),
            output_path: Some(output.clone()),
            file_name: None,
            auto_open: false,
        })
        .await
        .unwrap();

    wait_for_download(&engine, &content_id, DownloadState::Done).await;
    assert_eq!(std::fs::read(&output).unwrap(), clear);
    engine.shutdown().await;
}
