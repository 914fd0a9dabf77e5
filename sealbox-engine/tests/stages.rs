//! Stage-level tests against a file-backed job store and an in-memory filehost

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use sealbox_common::{
    CIPHER_FORMAT, DownloadState, JobKey, Stage, TransferProgress, UploadState, object_url,
};
use sealbox_engine::clock::{Clock, SystemClock};
use sealbox_engine::constants::DECRYPT_LEASE;
use sealbox_engine::crypto::{StreamHeader, encrypted_size, part_size_for, seal_buffer};
use sealbox_engine::db::{Database, NewDownload};
use sealbox_engine::host::FileHost;
use sealbox_engine::transfers::{
    CancelFlag, CopyDecrypt, DecryptionContext, ProgressReporter, UploadOutcome, run_decryption,
    run_download, run_upload,
};
use sealbox_engine::{EngineConfig, StageError};

use common::{
    FakeHost, HOST_URL, USER, insert_uploading_job, open_db, pattern, test_config, test_key,
};

const PART: u64 = 4096;
const LEASE_TTL_MILLIS: i64 = 120_000;

fn reporter(
    stage: Stage,
    job: JobKey,
    total: u64,
) -> (ProgressReporter, mpsc::UnboundedReceiver<TransferProgress>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressReporter::new(tx, stage, job, total, Duration::ZERO), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TransferProgress>) -> Vec<u64> {
    let mut positions = Vec::new();
    while let Ok(progress) = rx.try_recv() {
        positions.push(progress.position);
    }
    positions
}

fn now() -> i64 {
    SystemClock.now_millis()
}

// =============================================================================
// Upload
// =============================================================================

#[tokio::test]
async fn test_upload_resumes_after_last_acknowledged_part() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&test_config(dir.path())).await;
    let fake = FakeHost::new();
    let host: Arc<dyn FileHost> = fake.clone();

    let id = insert_uploading_job(&db, "cid-resume", 100, PART).await;
    // Parts 1-40 are accepted, the 41st fails
    fake.fail_put_number(41);

    let job = db.uploads.get(id).await.unwrap().unwrap();
    let (mut progress, _rx) = reporter(Stage::Upload, job.key(), 100 * PART);
    let err = run_upload(&db, &host, &job, &CancelFlag::new(), &mut progress, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "unexpected error {err:?}");

    let job = db.uploads.get(id).await.unwrap().unwrap();
    assert_eq!(job.position, 40 * PART);

    // What the coordinator does with a transient failure
    assert!(
        db.uploads
            .mark_error(id, UploadState::Uploading, UploadState::ErrorDuringPartUpload, &err.to_string())
            .await
            .unwrap()
    );
    assert!(
        db.uploads
            .requeue(id, UploadState::ErrorDuringPartUpload, UploadState::Ready, now())
            .await
            .unwrap()
    );
    assert!(db.uploads.transition(id, UploadState::Ready, UploadState::Uploading).await.unwrap());

    let job = db.uploads.get(id).await.unwrap().unwrap();
    assert_eq!(job.position, 40 * PART);
    assert_eq!(job.retries, 1);

    let (mut progress, _rx) = reporter(Stage::Upload, job.key(), 100 * PART);
    let outcome = run_upload(&db, &host, &job, &CancelFlag::new(), &mut progress, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(outcome, UploadOutcome::Verified));

    let positions: Vec<u64> = fake.puts().into_iter().map(|(_, position)| position).collect();
    assert_eq!(positions.len(), 101);
    assert_eq!(positions[40], 40 * PART);
    let resumed: Vec<u64> = (40..100).map(|n| n * PART).collect();
    assert_eq!(&positions[41..], resumed.as_slice());

    assert_eq!(fake.object("cid-resume").len() as u64, 100 * PART);
    assert!(fake.is_finalized("cid-resume"));
    let job = db.uploads.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, UploadState::Verifying);
    assert_eq!(job.position, 100 * PART);
}

#[tokio::test]
async fn test_upload_with_missing_part_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&test_config(dir.path())).await;
    let fake = FakeHost::new();
    let host: Arc<dyn FileHost> = fake.clone();

    let id = insert_uploading_job(&db, "cid-gap", 3, PART).await;
    let job = db.uploads.get(id).await.unwrap().unwrap();
    // Claim more ciphertext than the stored parts hold
    let job = sealbox_engine::db::UploadJob {
        encrypted_size: Some(4 * PART),
        ..job
    };

    let (mut progress, _rx) = reporter(Stage::Upload, job.key(), 4 * PART);
    let err = run_upload(&db, &host, &job, &CancelFlag::new(), &mut progress, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Protocol(_)), "unexpected error {err:?}");
    assert_eq!(fake.puts().len(), 3);
    assert!(!fake.is_finalized("cid-gap"));
}

#[test]
fn test_large_file_part_layout() {
    let clear = 250 * 1024 * 1024;
    let encrypted = encrypted_size(clear);
    let part = part_size_for(clear);

    assert_eq!(part, clear / 100);
    assert_eq!(encrypted.div_ceil(part), 101);
}

// =============================================================================
// Download
// =============================================================================

/// Insert a download and move it to `downloading`
async fn downloading_job(db: &Database, config: &EngineConfig, content_id: &str, size: u64) {
    let inserted = db
        .downloads
        .insert(
            &NewDownload {
                content_id: content_id.to_string(),
                user_id: USER.to_string(),
                host_url: HOST_URL.to_string(),
                encrypted_size: Some(size),
                format: CIPHER_FORMAT.to_string(),
                key: test_key().to_hex(),
                nonce: StreamHeader::random().to_hex(),
                output_path: config.files_dir().unwrap().join(content_id),
                auto_open: false,
            },
            now(),
        )
        .await
        .unwrap();
    assert!(inserted);
    assert!(
        db.downloads
            .transition(content_id, USER, DownloadState::Initial, DownloadState::Downloading)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_download_resumes_with_range_request() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = open_db(&config).await;
    let fake = FakeHost::new();
    let host: Arc<dyn FileHost> = fake.clone();

    let object = pattern(2_000_000);
    let url = object_url(HOST_URL, "cid-range");
    fake.serve(&url, object.clone());
    downloading_job(&db, &config, "cid-range", 2_000_000).await;

    // An earlier run left the first half in the buffer
    let buffer = dir.path().join("cid-range.enc");
    std::fs::write(&buffer, &object[..1_000_000]).unwrap();

    let job = db.downloads.get("cid-range", USER).await.unwrap().unwrap();
    let (mut progress, mut rx) = reporter(Stage::Download, job.key(), 2_000_000);
    let size = run_download(&db, &host, &job, &buffer, &CancelFlag::new(), &mut progress)
        .await
        .unwrap();

    assert_eq!(size, 2_000_000);
    assert_eq!(fake.gets(), vec![(url, 1_000_000)]);
    assert_eq!(std::fs::read(&buffer).unwrap(), object);

    let job = db.downloads.get("cid-range", USER).await.unwrap().unwrap();
    assert_eq!(job.state, DownloadState::Encrypted);
    assert_eq!(job.position, 2_000_000);

    let positions = drain(&mut rx);
    assert!(!positions.is_empty());
    assert!(positions.iter().all(|&p| p >= 1_000_000));
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(positions.last(), Some(&2_000_000));
}

#[tokio::test]
async fn test_download_restarts_when_range_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = open_db(&config).await;
    let fake = FakeHost::new();
    let host: Arc<dyn FileHost> = fake.clone();

    let object = pattern(300_000);
    let url = object_url(HOST_URL, "cid-full");
    fake.serve(&url, object.clone());
    fake.ignore_range();
    downloading_job(&db, &config, "cid-full", 300_000).await;

    let buffer = dir.path().join("cid-full.enc");
    std::fs::write(&buffer, &object[..100_000]).unwrap();

    let job = db.downloads.get("cid-full", USER).await.unwrap().unwrap();
    let (mut progress, _rx) = reporter(Stage::Download, job.key(), 300_000);
    let size = run_download(&db, &host, &job, &buffer, &CancelFlag::new(), &mut progress)
        .await
        .unwrap();

    assert_eq!(size, 300_000);
    assert_eq!(fake.gets(), vec![(url, 100_000)]);
    // The old prefix was discarded, not duplicated
    assert_eq!(std::fs::read(&buffer).unwrap(), object);
}

#[tokio::test]
async fn test_download_of_missing_object_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = open_db(&config).await;
    let host: Arc<dyn FileHost> = FakeHost::new();

    downloading_job(&db, &config, "cid-gone", 1_000).await;
    let buffer = dir.path().join("cid-gone.enc");

    let job = db.downloads.get("cid-gone", USER).await.unwrap().unwrap();
    let (mut progress, _rx) = reporter(Stage::Download, job.key(), 1_000);
    let err = run_download(&db, &host, &job, &buffer, &CancelFlag::new(), &mut progress)
        .await
        .unwrap_err();

    assert!(matches!(err, StageError::Protocol(_)), "unexpected error {err:?}");
    let job = db.downloads.get("cid-gone", USER).await.unwrap().unwrap();
    assert_eq!(job.state, DownloadState::Downloading);
    assert_eq!(job.position, 0);
}

// =============================================================================
// Decryption
// =============================================================================

#[tokio::test]
async fn test_decrypt_lease_serializes_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db_a = open_db(&config).await;
    let db_b = open_db(&config).await;

    let clear = pattern(200_000);
    let header = StreamHeader::random();
    let sealed = seal_buffer(&test_key(), header, &clear).unwrap();
    let output = dir.path().join("out.bin");

    db_a.downloads
        .insert(
            &NewDownload {
                content_id: "cid-lease".to_string(),
                user_id: USER.to_string(),
                host_url: HOST_URL.to_string(),
                encrypted_size: Some(sealed.len() as u64),
                format: CIPHER_FORMAT.to_string(),
                key: test_key().to_hex(),
                nonce: header.to_hex(),
                output_path: output.clone(),
                auto_open: false,
            },
            now(),
        )
        .await
        .unwrap();
    db_a.downloads
        .transition("cid-lease", USER, DownloadState::Initial, DownloadState::Downloading)
        .await
        .unwrap();
    db_a.downloads
        .finish_download("cid-lease", USER, sealed.len() as u64)
        .await
        .unwrap();

    let buffer = dir.path().join("cid-lease.enc");
    std::fs::write(&buffer, &sealed).unwrap();

    assert!(
        db_a.leases
            .try_acquire(DECRYPT_LEASE, "instance-a", now(), LEASE_TTL_MILLIS)
            .await
            .unwrap()
    );

    let clock = SystemClock;
    let strategy = CopyDecrypt;
    let ctx = DecryptionContext {
        db: &db_b,
        clock: &clock,
        strategy: &strategy,
        owner: "instance-b",
        lease_ttl_millis: LEASE_TTL_MILLIS,
    };
    let job = db_b.downloads.get("cid-lease", USER).await.unwrap().unwrap();

    let (mut progress, _rx) = reporter(Stage::Decryption, job.key(), sealed.len() as u64);
    let err = run_decryption(&ctx, &job, &buffer, &CancelFlag::new(), &mut progress)
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Busy), "unexpected error {err:?}");
    assert!(buffer.exists());
    assert!(!output.exists());

    assert!(db_a.leases.release(DECRYPT_LEASE, "instance-a").await.unwrap());

    let (mut progress, _rx) = reporter(Stage::Decryption, job.key(), sealed.len() as u64);
    let size = run_decryption(&ctx, &job, &buffer, &CancelFlag::new(), &mut progress)
        .await
        .unwrap();
    assert_eq!(size, clear.len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), clear);
    assert!(!buffer.exists());

    // The lease is free again once the run ends
    assert_eq!(db_a.leases.holder(DECRYPT_LEASE, now()).await.unwrap(), None);
}

#[tokio::test]
async fn test_decrypt_skips_job_paused_before_it_started() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = open_db(&config).await;

    let header = StreamHeader::random();
    let sealed = seal_buffer(&test_key(), header, &pattern(10_000)).unwrap();
    let output = dir.path().join("paused.bin");
    db.downloads
        .insert(
            &NewDownload {
                content_id: "cid-paused".to_string(),
                user_id: USER.to_string(),
                host_url: HOST_URL.to_string(),
                encrypted_size: Some(sealed.len() as u64),
                format: CIPHER_FORMAT.to_string(),
                key: test_key().to_hex(),
                nonce: header.to_hex(),
                output_path: output.clone(),
                auto_open: false,
            },
            now(),
        )
        .await
        .unwrap();
    db.downloads
        .transition("cid-paused", USER, DownloadState::Initial, DownloadState::Downloading)
        .await
        .unwrap();
    db.downloads
        .finish_download("cid-paused", USER, sealed.len() as u64)
        .await
        .unwrap();
    let buffer = dir.path().join("cid-paused.enc");
    std::fs::write(&buffer, &sealed).unwrap();

    // Loaded while encrypted, paused before the stage ran
    let job = db.downloads.get("cid-paused", USER).await.unwrap().unwrap();
    assert!(
        db.downloads
            .transition("cid-paused", USER, DownloadState::Encrypted, DownloadState::Paused)
            .await
            .unwrap()
    );

    let clock = SystemClock;
    let strategy = CopyDecrypt;
    let ctx = DecryptionContext {
        db: &db,
        clock: &clock,
        strategy: &strategy,
        owner: "instance-a",
        lease_ttl_millis: LEASE_TTL_MILLIS,
    };
    let (mut progress, _rx) = reporter(Stage::Decryption, job.key(), sealed.len() as u64);
    let err = run_decryption(&ctx, &job, &buffer, &CancelFlag::new(), &mut progress)
        .await
        .unwrap_err();

    assert!(matches!(err, StageError::Skipped), "unexpected error {err:?}");
    assert_eq!(db.leases.holder(DECRYPT_LEASE, now()).await.unwrap(), None);
    assert!(buffer.exists());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_decrypt_with_wrong_key_fails_and_keeps_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db = open_db(&config).await;

    let header = StreamHeader::random();
    let sealed = seal_buffer(&test_key(), header, &pattern(10_000)).unwrap();
    let output = dir.path().join("wrong.bin");

    db.downloads
        .insert(
            &NewDownload {
                content_id: "cid-wrong".to_string(),
                user_id: USER.to_string(),
                host_url: HOST_URL.to_string(),
                encrypted_size: Some(sealed.len() as u64),
                format: CIPHER_FORMAT.to_string(),
                key: "11".repeat(32),
                nonce: header.to_hex(),
                output_path: output.clone(),
                auto_open: false,
            },
            now(),
        )
        .await
        .unwrap();
    db.downloads
        .transition("cid-wrong", USER, DownloadState::Initial, DownloadState::Downloading)
        .await
        .unwrap();
    db.downloads
        .finish_download("cid-wrong", USER, sealed.len() as u64)
        .await
        .unwrap();
    let buffer = dir.path().join("cid-wrong.enc");
    std::fs::write(&buffer, &sealed).unwrap();

    let clock = SystemClock;
    let strategy = CopyDecrypt;
    let ctx = DecryptionContext {
        db: &db,
        clock: &clock,
        strategy: &strategy,
        owner: "instance-a",
        lease_ttl_millis: LEASE_TTL_MILLIS,
    };
    let job = db.downloads.get("cid-wrong", USER).await.unwrap().unwrap();
    let (mut progress, _rx) = reporter(Stage::Decryption, job.key(), sealed.len() as u64);
    let err = run_decryption(&ctx, &job, &buffer, &CancelFlag::new(), &mut progress)
        .await
        .unwrap_err();

    assert!(matches!(err, StageError::Decryption(_)), "unexpected error {err:?}");
    assert!(!output.exists());
    assert_eq!(std::fs::read(&buffer).unwrap(), sealed);
    assert_eq!(db.leases.holder(DECRYPT_LEASE, now()).await.unwrap(), None);
}
