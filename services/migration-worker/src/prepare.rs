// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Item preparation
//!
//! Turns a catalog row into something uploadable: resolves the file under
//! the library root, converts formats the destination does not accept,
//! hashes the result and collects metadata from a sibling `metadata.opf`
//! or, failing that, from the file name.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use migration_types::{CatalogItem, CompletedStatus, ErrorClass};

use crate::config::WorkerConfig;
use crate::destination::{ItemMetadata, UploadRequest, mime_for};

#[allow(clippy::expect_used)]
mod patterns {
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        pub static ref TITLE: Regex =
            Regex::new(r"(?s)<dc:title[^>]*>(.*?)</dc:title>").expect("valid regex");
        pub static ref CREATOR: Regex =
            Regex::new(r"(?s)<dc:creator[^>]*>(.*?)</dc:creator>").expect("valid regex");
        pub static ref LANGUAGE: Regex =
            Regex::new(r"(?s)<dc:language[^>]*>(.*?)</dc:language>").expect("valid regex");
        pub static ref META: Regex =
            Regex::new(r#"<meta\s+([^>]*?)/?>"#).expect("valid regex");
        pub static ref ATTR: Regex =
            Regex::new(r#"(\w[\w:]*)\s*=\s*"([^"]*)""#).expect("valid regex");
    }
}

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("file not found: {0}")]
    Missing(PathBuf),
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("conversion made no progress for {0:?}")]
    ConversionStalled(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrepareError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PrepareError::Missing(_) | PrepareError::Io(_) => ErrorClass::Io,
            PrepareError::Conversion(_) => ErrorClass::Conversion,
            PrepareError::ConversionStalled(_) => ErrorClass::StuckUpload,
        }
    }

    /// Terminal checkpoint status for an item that failed preparation
    pub fn status(&self) -> CompletedStatus {
        CompletedStatus::Skipped
    }
}

/// A file ready for upload. A converted temp file is removed on drop.
#[derive(Debug)]
pub struct PreparedItem {
    pub item: CatalogItem,
    pub request: UploadRequest,
    converted: Option<PathBuf>,
}

impl PreparedItem {
    pub fn hash(&self) -> &str {
        &self.request.hash
    }

    pub fn size(&self) -> u64 {
        self.request.size
    }

    pub fn has_title(&self) -> bool {
        self.request
            .metadata
            .title
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}

impl Drop for PreparedItem {
    fn drop(&mut self) {
        if let Some(path) = self.converted.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove converted file");
                }
            }
        }
    }
}

/// Settings the preparer needs from the worker configuration
#[derive(Clone, Debug)]
pub struct Preparer {
    library_root: PathBuf,
    scratch_dir: PathBuf,
    accepted_formats: Vec<String>,
    convert_command: Option<String>,
    convert_target: String,
    link_mode: bool,
    stall_window: Duration,
    hard_timeout: Duration,
}

impl Preparer {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            library_root: config.library_root.clone(),
            scratch_dir: config
                .state_dir
                .join(format!("worker-{}.scratch", config.worker_id)),
            accepted_formats: config.accepted_formats.clone(),
            convert_command: config.convert_command.clone(),
            convert_target: config.convert_target.clone(),
            link_mode: config.link_mode,
            stall_window: config.stuck_upload,
            hard_timeout: config.upload_hard_timeout,
        }
    }

    fn is_accepted(&self, format: &str) -> bool {
        self.accepted_formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(format))
    }

    pub async fn prepare(&self, item: &CatalogItem) -> Result<PreparedItem, PrepareError> {
        let source = self.library_root.join(&item.path);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(PrepareError::Missing(source));
        }

        let (file, format, converted) =
            if self.is_accepted(&item.format) || self.convert_command.is_none() {
                (source.clone(), item.format.clone(), None)
            } else {
                let out = self.convert(item, &source).await?;
                (out.clone(), self.convert_target.clone(), Some(out))
            };

        // Registered before hashing so a failure below still cleans up.
        let mut prepared = PreparedItem {
            item: item.clone(),
            request: UploadRequest {
                file: file.clone(),
                file_name: String::new(),
                mime_type: mime_for(&format).to_string(),
                size: 0,
                hash: String::new(),
                metadata: ItemMetadata::default(),
                storage_path: None,
            },
            converted,
        };

        let (hash, size) = hash_file(&file).await?;
        let metadata = read_metadata(&source).await;

        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.{}", item.id, format));

        prepared.request.file_name = file_name;
        prepared.request.size = size;
        prepared.request.hash = hash;
        prepared.request.metadata = metadata;
        if self.link_mode && prepared.converted.is_none() {
            prepared.request.storage_path = Some(source.to_string_lossy().into_owned());
        }

        Ok(prepared)
    }

    /// Run the external converter under a progress watchdog.
    async fn convert(&self, item: &CatalogItem, source: &Path) -> Result<PathBuf, PrepareError> {
        let Some(template) = &self.convert_command else {
            return Err(PrepareError::Conversion("no converter configured".to_string()));
        };

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let output = self
            .scratch_dir
            .join(format!("{}.{}", item.id, self.convert_target));
        let _ = tokio::fs::remove_file(&output).await;

        let args = expand_command(template, source, &output);
        let Some((program, rest)) = args.split_first() else {
            return Err(PrepareError::Conversion("empty convert command".to_string()));
        };

        tracing::debug!(item_id = item.id, program = %program, "Converting item");
        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PrepareError::Conversion(format!("spawning {}: {}", program, e)))?;

        // Drained concurrently so a chatty converter cannot fill the pipe.
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text).await;
                text
            })
        });

        let started = Instant::now();
        let mut last_size = 0u64;
        let mut last_growth = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        let status = loop {
            tokio::select! {
                status = child.wait() => break Ok(status?),
                _ = tick.tick() => {
                    let size = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
                    if size > last_size {
                        last_size = size;
                        last_growth = Instant::now();
                    }
                    if last_growth.elapsed() >= self.stall_window {
                        break Err(PrepareError::ConversionStalled(self.stall_window));
                    }
                    if started.elapsed() >= self.hard_timeout {
                        break Err(PrepareError::Conversion(format!(
                            "exceeded {}s ceiling",
                            self.hard_timeout.as_secs()
                        )));
                    }
                }
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    item_id = item.id,
                    elapsed_secs = started.elapsed().as_secs(),
                    error = %e,
                    "Terminating conversion"
                );
                terminate(&mut child, Duration::from_secs(10)).await;
                let _ = tokio::fs::remove_file(&output).await;
                return Err(e);
            }
        };

        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let _ = tokio::fs::remove_file(&output).await;
            return Err(PrepareError::Conversion(format!(
                "{} exited with {}: {}",
                program,
                status,
                stderr.trim()
            )));
        }

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(PrepareError::Conversion(format!(
                "{} produced no output",
                program
            )));
        }
        Ok(output)
    }
}

/// Graceful signal first, forced kill after `grace`.
async fn terminate(child: &mut tokio::process::Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill conversion process");
    }
}

/// Split a command template on whitespace and fill in the placeholders.
pub fn expand_command(template: &str, input: &Path, output: &Path) -> Vec<String> {
    let input = input.to_string_lossy();
    let output = output.to_string_lossy();
    template
        .split_whitespace()
        .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
        .collect()
}

/// Streamed SHA-256 (lowercase hex) and byte count.
pub async fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok((hex, total))
}

/// Metadata from `metadata.opf` next to the file, else from its name.
pub async fn read_metadata(file: &Path) -> ItemMetadata {
    let opf = file.with_file_name("metadata.opf");
    let mut meta = match tokio::fs::read_to_string(&opf).await {
        Ok(text) => parse_opf(&text),
        Err(_) => ItemMetadata::default(),
    };

    if meta.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
        let (author, title) = metadata_from_filename(file);
        meta.title = title;
        if meta.authors.is_empty() {
            meta.authors.extend(author);
        }
    }
    meta
}

/// Parse the Dublin Core fields and series metadata from an OPF document.
pub fn parse_opf(text: &str) -> ItemMetadata {
    let first = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| unescape(m.as_str().trim()))
            .filter(|s| !s.is_empty())
    };

    let mut meta = ItemMetadata {
        title: first(&patterns::TITLE),
        language: first(&patterns::LANGUAGE),
        authors: patterns::CREATOR
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| unescape(m.as_str().trim()))
            .filter(|s| !s.is_empty())
            .collect(),
        ..Default::default()
    };

    for tag in patterns::META.captures_iter(text) {
        let Some(attrs) = tag.get(1) else { continue };
        let mut name = None;
        let mut content = None;
        for attr in patterns::ATTR.captures_iter(attrs.as_str()) {
            match (attr.get(1).map(|m| m.as_str()), attr.get(2)) {
                (Some("name"), Some(v)) => name = Some(v.as_str()),
                (Some("content"), Some(v)) => content = Some(unescape(v.as_str())),
                _ => {}
            }
        }
        match (name, content) {
            (Some("calibre:series"), Some(v)) if !v.is_empty() => meta.series = Some(v),
            (Some("calibre:series_index"), Some(v)) => meta.series_index = v.parse().ok(),
            _ => {}
        }
    }

    meta
}

/// `Author - Title.ext` gives both; anything else is a bare title.
pub fn metadata_from_filename(file: &Path) -> (Option<String>, Option<String>) {
    let Some(stem) = file.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return (None, None);
    };
    let stem = stem.replace('_', " ");
    let stem = stem.trim();
    if stem.is_empty() {
        return (None, None);
    }
    match stem.split_once(" - ") {
        Some((author, title)) if !author.trim().is_empty() && !title.trim().is_empty() => (
            Some(author.trim().to_string()),
            Some(title.trim().to_string()),
        ),
        _ => (None, Some(stem.to_string())),
    }
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
