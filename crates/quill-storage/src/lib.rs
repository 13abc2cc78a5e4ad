//! Content encoding, hashing, and durable object storage for Quill.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "quill-storage";

const DEFAULT_IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Compress a body with gzip and encode the bytes as base64 so the result is
/// safe to embed in a text column or SQL literal.
pub fn encode_body(body: &str) -> anyhow::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body.as_bytes())
        .context("compressing body")?;
    let compressed = encoder.finish().context("finishing gzip stream")?;
    Ok(BASE64.encode(compressed))
}

/// Reverse of [`encode_body`]. Must reproduce the input byte-for-byte; the
/// serving path depends on it.
pub fn decode_body(encoded: &str) -> anyhow::Result<String> {
    let compressed = BASE64.decode(encoded).context("decoding base64 body")?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut body = String::new();
    decoder
        .read_to_string(&mut body)
        .context("decompressing body")?;
    Ok(body)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn content_type_from_extension(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

/// Determine a content type for downloaded image bytes: trust the response
/// hint, fall back to the URL's path extension, default to a generic image
/// type when both fail.
pub fn content_type_for(header_hint: Option<&str>, url: &str) -> String {
    if let Some(hint) = header_hint {
        let hint = hint.split(';').next().unwrap_or(hint).trim();
        if !hint.is_empty() {
            return hint.to_string();
        }
    }
    content_type_from_extension(url)
        .unwrap_or(DEFAULT_IMAGE_CONTENT_TYPE)
        .to_string()
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

/// Hash-derived storage key: hash-prefixed directory plus hash-named file,
/// so identical bytes always land on the same object.
pub fn storage_key_for(content_hash: &str, extension: &str) -> String {
    let prefix = &content_hash[..2.min(content_hash.len())];
    format!("images/{prefix}/{content_hash}.{extension}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Upload retry policy: a small fixed number of attempts with linearly
/// increasing delay.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub max_retries: usize,
    pub step: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step: Duration::from_millis(500),
        }
    }
}

impl LinearBackoff {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.step.saturating_mul(attempt_index as u32 + 1)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading upload source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Durable object storage seam: existence probe + keyed upload.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Public URL an object at `key` is served from.
    fn public_url(&self, key: &str) -> String;

    /// Lightweight probe for an already-uploaded object at `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Upload the file at `path` to `key`. The caller owns the scratch file
    /// and removes it whatever the outcome.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Write endpoint, e.g. the bucket API base URL.
    pub endpoint: String,
    pub bucket: String,
    /// Public base URL objects are served from.
    pub public_base_url: String,
    pub token: String,
    pub backoff: LinearBackoff,
}

/// Bucket client speaking plain HTTP: HEAD against the public URL for the
/// existence probe, authenticated PUT against the write endpoint for uploads.
#[derive(Debug)]
pub struct HttpObjectStore {
    http: reqwest::Client,
    config: ObjectStoreConfig,
}

impl HttpObjectStore {
    pub fn new(config: ObjectStoreConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building object store client")?;
        Ok(Self { http, config })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            key
        )
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.config.public_base_url.trim_end_matches('/'),
            key
        )
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let url = self.public_url(key);
        let response = self.http.head(&url).send().await?;
        Ok(response.status().is_success())
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let url = self.object_url(key);
        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let result = self
                .http
                .put(&url)
                .bearer_auth(&self.config.token)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes.clone())
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(key, bytes = bytes.len(), "uploaded object");
                        return Ok(());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(StoreError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
