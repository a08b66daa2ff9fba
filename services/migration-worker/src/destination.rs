// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Destination service client
//!
//! The destination exposes three calls: a batched existence check, a
//! multipart upload and a listing of known `(hash, size)` pairs. The
//! [`Destination`] trait is the seam the pipeline, walker and dedup cache
//! are written against; [`HttpDestination`] is the production client.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::TryStreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::io::ReaderStream;

use migration_types::ErrorClass;

use crate::retry::Retryable;

#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("no upload progress for {0:?}")]
    Stalled(Duration),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("rejected with {status}: {body}")]
    Validation { status: u16, body: String },
    #[error("malformed content ({status}): {body}")]
    MalformedContent { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DestinationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DestinationError::Connect(_) => ErrorClass::Transport,
            DestinationError::Timeout(_) => ErrorClass::Timeout,
            DestinationError::Stalled(_) => ErrorClass::StuckUpload,
            DestinationError::Server { .. } => ErrorClass::Server,
            DestinationError::Validation { .. } => ErrorClass::Validation,
            DestinationError::MalformedContent { .. } => ErrorClass::MalformedContent,
            DestinationError::Protocol(_) => ErrorClass::Internal,
            DestinationError::Io(_) => ErrorClass::Io,
        }
    }
}

impl Retryable for DestinationError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DestinationError::Connect(_)
                | DestinationError::Timeout(_)
                | DestinationError::Stalled(_)
                | DestinationError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for DestinationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DestinationError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() || e.is_body() {
            DestinationError::Connect(e.to_string())
        } else if e.is_decode() {
            DestinationError::Protocol(e.to_string())
        } else {
            DestinationError::Connect(e.to_string())
        }
    }
}

/// Map a non-success status onto the error taxonomy.
pub fn status_error(status: StatusCode, body: String) -> DestinationError {
    let code = status.as_u16();
    match code {
        400 | 422 => DestinationError::Validation { status: code, body },
        413 | 415 => DestinationError::MalformedContent { status: code, body },
        408 | 429 => DestinationError::Server { status: code, body },
        _ if status.is_server_error() => DestinationError::Server { status: code, body },
        _ => DestinationError::Validation { status: code, body },
    }
}

/// One entry of a batched existence check.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExistenceQuery {
    pub size: u64,
    pub mime_type: String,
    pub extension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ExistenceResult {
    pub exists: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// `(hash, size)` pair known to the destination.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct HashEntry {
    pub hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Descriptive fields sent along with an upload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub language: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
}

/// A prepared file ready to go over the wire.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub file: PathBuf,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub hash: String,
    pub metadata: ItemMetadata,
    /// Pre-resolved path for link-instead-of-copy mode
    pub storage_path: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    AlreadyExists,
}

/// Byte counter advanced as the upload body is read.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    bytes: Arc<AtomicU64>,
}

impl Progress {
    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// One existence request; the caller chunks large batches.
    async fn check_exists(
        &self,
        items: &[ExistenceQuery],
    ) -> Result<Vec<ExistenceResult>, DestinationError>;

    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &Progress,
    ) -> Result<UploadOutcome, DestinationError>;

    /// Known entries, optionally only those created after the watermark.
    async fn list_hashes(
        &self,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<HashEntry>, DestinationError>;
}

#[derive(Serialize)]
struct ExistsRequest<'a> {
    items: &'a [ExistenceQuery],
}

#[derive(Deserialize)]
struct ExistsResponse {
    results: Vec<ExistenceResult>,
}

#[derive(Deserialize)]
struct HashesResponse {
    entries: Vec<HashEntry>,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    status: Option<String>,
}

/// HTTP client for the destination service
pub struct HttpDestination {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpDestination {
    /// `request_timeout` bounds existence checks and hash listings; uploads
    /// are bounded by the pipeline's watchdog instead.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, DestinationError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DestinationError::Protocol(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl Destination for HttpDestination {
    async fn check_exists(
        &self,
        items: &[ExistenceQuery],
    ) -> Result<Vec<ExistenceResult>, DestinationError> {
        let response = self
            .authed(self.client.post(self.url("/api/v1/files/exists")))
            .timeout(self.request_timeout)
            .json(&ExistsRequest { items })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let parsed: ExistsResponse = response.json().await?;
        if parsed.results.len() != items.len() {
            return Err(DestinationError::Protocol(format!(
                "existence check returned {} results for {} items",
                parsed.results.len(),
                items.len()
            )));
        }
        Ok(parsed.results)
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &Progress,
    ) -> Result<UploadOutcome, DestinationError> {
        use reqwest::multipart::{Form, Part};

        let file = tokio::fs::File::open(&request.file).await?;
        let counter = progress.clone();
        let stream = ReaderStream::new(file).inspect_ok(move |chunk| counter.add(chunk.len() as u64));
        let body = reqwest::Body::wrap_stream(stream);

        let part = Part::stream_with_length(body, request.size)
            .file_name(request.file_name.clone())
            .mime_str(&request.mime_type)
            .map_err(|e| DestinationError::Protocol(format!("invalid mime type: {}", e)))?;

        let meta = &request.metadata;
        let mut form = Form::new()
            .part("file", part)
            .text("content_hash", request.hash.clone());
        if let Some(title) = &meta.title {
            form = form.text("title", title.clone());
        }
        for author in &meta.authors {
            form = form.text("authors", author.clone());
        }
        if let Some(language) = &meta.language {
            form = form.text("language", language.clone());
        }
        if let Some(series) = &meta.series {
            form = form.text("series", series.clone());
        }
        if let Some(index) = meta.series_index {
            form = form.text("series_index", index.to_string());
        }
        if let Some(storage_path) = &request.storage_path {
            form = form.text("storage_path", storage_path.clone());
        }

        let response = self
            .authed(self.client.post(self.url("/api/v1/files")))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Ok(UploadOutcome::AlreadyExists);
        }
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(status, body));
        }

        // Some deployments answer 200 with a structured "exists" marker.
        let outcome = serde_json::from_str::<UploadResponse>(&body)
            .ok()
            .and_then(|r| r.status);
        match outcome.as_deref() {
            Some("exists") => Ok(UploadOutcome::AlreadyExists),
            _ => Ok(UploadOutcome::Uploaded),
        }
    }

    async fn list_hashes(
        &self,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<HashEntry>, DestinationError> {
        let mut url = reqwest::Url::parse(&self.url("/api/v1/files/hashes"))
            .map_err(|e| DestinationError::Protocol(format!("invalid destination URL: {}", e)))?;
        if let Some(after) = created_after {
            url.query_pairs_mut().append_pair(
                "created_after",
                &after.to_rfc3339_opts(SecondsFormat::Micros, true),
            );
        }

        let response = self
            .authed(self.client.get(url))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        let parsed: HashesResponse = response.json().await?;
        Ok(parsed.entries)
    }
}

/// MIME type for a catalog format
pub fn mime_for(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "epub" => "application/epub+zip",
        "pdf" => "application/pdf",
        "mobi" => "application/x-mobipocket-ebook",
        "azw3" | "azw" => "application/vnd.amazon.ebook",
        "cbz" => "application/vnd.comicbook+zip",
        "cbr" => "application/vnd.comicbook-rar",
        "txt" => "text/plain",
        "djvu" => "image/vnd.djvu",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory destination used by the unit tests.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MockDestination {
        /// Sizes the size-only existence check reports as present
        pub existing_sizes: Mutex<HashSet<u64>>,
        /// Hash listing served to the dedup cache
        pub hashes: Mutex<Vec<HashEntry>>,
        /// Hashes uploaded so far
        pub uploaded: Mutex<Vec<String>>,
        /// Scripted upload failures, consumed one per attempt, keyed by hash
        pub failures: Mutex<HashMap<String, Vec<DestinationError>>>,
        pub exists_calls: AtomicU64,
        pub list_calls: AtomicU64,
        /// Answer existence checks with one result too few
        pub short_answers: std::sync::atomic::AtomicBool,
        /// Fail hash listings with a connection error
        pub listing_down: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Destination for MockDestination {
        async fn check_exists(
            &self,
            items: &[ExistenceQuery],
        ) -> Result<Vec<ExistenceResult>, DestinationError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            let sizes = self.existing_sizes.lock().await;
            let mut results: Vec<ExistenceResult> = items
                .iter()
                .map(|q| ExistenceResult {
                    exists: sizes.contains(&q.size),
                    error: None,
                })
                .collect();
            if self.short_answers.load(Ordering::SeqCst) {
                results.pop();
            }
            Ok(results)
        }

        async fn upload(
            &self,
            request: &UploadRequest,
            progress: &Progress,
        ) -> Result<UploadOutcome, DestinationError> {
            if let Some(queue) = self.failures.lock().await.get_mut(&request.hash) {
                if !queue.is_empty() {
                    return Err(queue.remove(0));
                }
            }
            progress.add(request.size);
            let mut uploaded = self.uploaded.lock().await;
            if uploaded.contains(&request.hash) {
                return Ok(UploadOutcome::AlreadyExists);
            }
            uploaded.push(request.hash.clone());
            Ok(UploadOutcome::Uploaded)
        }

        async fn list_hashes(
            &self,
            created_after: Option<DateTime<Utc>>,
        ) -> Result<Vec<HashEntry>, DestinationError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.listing_down.load(Ordering::SeqCst) {
                return Err(DestinationError::Connect("connection refused".to_string()));
            }
            let hashes = self.hashes.lock().await;
            Ok(hashes
                .iter()
                .filter(|e| created_after.is_none_or(|after| e.created_at > after))
                .cloned()
                .collect())
        }
    }
}
