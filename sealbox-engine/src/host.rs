//! Filehost client
//!
//! The filehost stores encrypted objects under `/files/{content_id}`:
//!
//! - `PUT /files/{content_id}/{position}` uploads one part
//! - `POST /files/{content_id}` asks the host to verify the complete object
//! - `GET /files/{content_id}` streams it back, honouring `Range: bytes={pos}-`

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use thiserror::Error;

use sealbox_common::{object_url, part_url};

/// Failures talking to a filehost
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// Connection refused, reset or dropped mid-body
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    /// The host answered with a status the protocol does not allow
    #[error("unexpected status {0}")]
    Status(u16),
    /// Headers contradict the request
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Body of a download response
pub type ByteStream = BoxStream<'static, Result<Bytes, HostError>>;

/// How the host answered a download request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// 200: the body starts at byte zero
    Full,
    /// 206: the body starts at `start`
    Partial { start: u64 },
}

/// An open download stream
pub struct DownloadResponse {
    pub kind: ResponseKind,
    /// Full object length, when the host reports it
    pub total: Option<u64>,
    pub body: ByteStream,
}

/// Remote storage for encrypted objects
#[async_trait]
pub trait FileHost: Send + Sync {
    /// Upload one part at its byte position
    async fn put_part(
        &self,
        host_url: &str,
        content_id: &str,
        position: u64,
        data: Bytes,
    ) -> Result<(), HostError>;

    /// Ask the host to verify the complete object
    async fn finalize(&self, host_url: &str, content_id: &str) -> Result<(), HostError>;

    /// Open a download, resuming at `from` when it is non-zero
    ///
    /// Any status other than 200 or 206 is returned as [`HostError::Status`].
    async fn open_download(&self, url: &str, from: u64) -> Result<DownloadResponse, HostError>;
}

fn map_reqwest_error(err: reqwest::Error) -> HostError {
    if err.is_timeout() {
        HostError::Timeout
    } else {
        HostError::Transport(err.to_string())
    }
}

/// Parse `bytes {start}-{end}/{total}` into its start and total
///
/// The total may be `*` when unknown.
pub fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    Some((start, total))
}

/// Filehost reached over HTTP
#[derive(Clone)]
pub struct HttpFileHost {
    client: Client,
    request_timeout: Duration,
}

impl HttpFileHost {
    /// Build a client; `request_timeout` bounds part uploads and finalize calls
    /// and the connection phase of downloads
    pub fn new(request_timeout: Duration) -> Result<Self, HostError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(map_reqwest_error)?;

        Ok(Self {
            client,
            request_timeout,
        })
    }
}

#[async_trait]
impl FileHost for HttpFileHost {
    async fn put_part(
        &self,
        host_url: &str,
        content_id: &str,
        position: u64,
        data: Bytes,
    ) -> Result<(), HostError> {
        let response = self
            .client
            .put(part_url(host_url, content_id, position))
            .timeout(self.request_timeout)
            .body(data)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(HostError::Status(response.status().as_u16()))
        }
    }

    async fn finalize(&self, host_url: &str, content_id: &str) -> Result<(), HostError> {
        let response = self
            .client
            .post(object_url(host_url, content_id))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(HostError::Status(status.as_u16())),
        }
    }

    async fn open_download(&self, url: &str, from: u64) -> Result<DownloadResponse, HostError> {
        let mut request = self.client.get(url);
        if from > 0 {
            request = request.header(RANGE, format!("bytes={from}-"));
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        let (kind, total) = match response.status() {
            StatusCode::OK => (ResponseKind::Full, response.content_length()),
            StatusCode::PARTIAL_CONTENT => {
                let header = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        HostError::InvalidResponse("206 without Content-Range".to_string())
                    })?;
                let (start, total) = parse_content_range(header).ok_or_else(|| {
                    HostError::InvalidResponse(format!("malformed Content-Range '{header}'"))
                })?;
                (ResponseKind::Partial { start }, total)
            }
            status => return Err(HostError::Status(status.as_u16())),
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error))
            .boxed();

        Ok(DownloadResponse { kind, total, body })
    }
}
