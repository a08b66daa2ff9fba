// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Fix history and the root-cause ledger
//!
//! `fix-history.json` is a JSON array of [`FixAttemptRecord`]s capped at a
//! fixed length; it drives cooldown and budget accounting. Because old
//! records fall off the end, recurring causes are tracked separately in
//! `root-causes.json`: one entry per distinct cause with an occurrence
//! count, kept forever. `operator-resets.json` holds the time of each
//! worker's last operator reset; fixes before it no longer count against
//! the worker's budget.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use migration_types::FixAttemptRecord;

pub const FIX_HISTORY_FILE: &str = "fix-history.json";
pub const ROOT_CAUSE_FILE: &str = "root-causes.json";
pub const OPERATOR_RESET_FILE: &str = "operator-resets.json";

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T, HistoryError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(HistoryError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&text).map_err(|source| HistoryError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), HistoryError> {
    let text = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, text)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Capped, durable list of fix attempts
#[derive(Debug)]
pub struct FixHistory {
    path: PathBuf,
    max_len: usize,
    records: Vec<FixAttemptRecord>,
}

impl FixHistory {
    pub fn open(state_dir: &Path, max_len: usize) -> Result<Self, HistoryError> {
        let path = state_dir.join(FIX_HISTORY_FILE);
        let records = read_json(&path)?;
        Ok(Self {
            path,
            max_len: max_len.max(1),
            records,
        })
    }

    pub fn records(&self) -> &[FixAttemptRecord] {
        &self.records
    }

    pub fn for_worker(&self, worker_id: u32) -> impl Iterator<Item = &FixAttemptRecord> {
        self.records.iter().filter(move |r| r.worker_id == worker_id)
    }

    pub fn last_for_worker(&self, worker_id: u32) -> Option<&FixAttemptRecord> {
        self.records.iter().rev().find(|r| r.worker_id == worker_id)
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len.max(1);
    }

    pub fn append(&mut self, record: FixAttemptRecord) -> Result<(), HistoryError> {
        self.records.push(record);
        if self.records.len() > self.max_len {
            let excess = self.records.len() - self.max_len;
            self.records.drain(..excess);
        }
        write_json(&self.path, &self.records)
    }

    /// Fill in the verification result of the record written at `timestamp`.
    pub fn set_verified(
        &mut self,
        worker_id: u32,
        timestamp: DateTime<Utc>,
        verified: bool,
    ) -> Result<bool, HistoryError> {
        let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.worker_id == worker_id && r.timestamp == timestamp)
        else {
            return Ok(false);
        };
        record.verified_success = Some(verified);
        write_json(&self.path, &self.records)?;
        Ok(true)
    }
}

/// Last operator reset per worker
#[derive(Debug)]
pub struct OperatorResets {
    path: PathBuf,
    resets: BTreeMap<u32, DateTime<Utc>>,
}

impl OperatorResets {
    pub fn open(state_dir: &Path) -> Result<Self, HistoryError> {
        let path = state_dir.join(OPERATOR_RESET_FILE);
        let resets = read_json(&path)?;
        Ok(Self { path, resets })
    }

    pub fn last(&self, worker_id: u32) -> Option<DateTime<Utc>> {
        self.resets.get(&worker_id).copied()
    }

    pub fn record(&mut self, worker_id: u32, at: DateTime<Utc>) -> Result<(), HistoryError> {
        self.resets.insert(worker_id, at);
        write_json(&self.path, &self.resets)
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "was", "were", "are", "not", "but",
    "into", "after", "before", "while", "when", "has", "have", "had", "its", "worker",
];

/// Lowercased alphanumeric words of three or more letters, minus filler.
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .map(|w| w.to_ascii_lowercase())
        .filter(|w| w.len() >= 3 && !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Dice coefficient over the two keyword sets.
pub fn similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    2.0 * shared as f64 / (a.len() + b.len()) as f64
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RootCauseEntry {
    pub cause: String,
    pub keywords: BTreeSet<String>,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Every root cause ever recorded, merged by keyword similarity
#[derive(Debug)]
pub struct RootCauseLedger {
    path: PathBuf,
    similarity: f64,
    entries: Vec<RootCauseEntry>,
}

impl RootCauseLedger {
    pub fn open(state_dir: &Path, similarity: f64) -> Result<Self, HistoryError> {
        let path = state_dir.join(ROOT_CAUSE_FILE);
        let entries = read_json(&path)?;
        Ok(Self {
            path,
            similarity,
            entries,
        })
    }

    pub fn set_similarity(&mut self, similarity: f64) {
        self.similarity = similarity;
    }

    pub fn entries(&self) -> &[RootCauseEntry] {
        &self.entries
    }

    fn best_match(&self, words: &BTreeSet<String>) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, similarity(words, &e.keywords)))
            .filter(|(_, s)| *s >= self.similarity)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Prior occurrences of causes similar to `cause`
    pub fn occurrences(&self, cause: &str) -> u32 {
        let words = keywords(cause);
        if words.is_empty() {
            return 0;
        }
        self.entries
            .iter()
            .filter(|e| similarity(&words, &e.keywords) >= self.similarity)
            .map(|e| e.occurrences)
            .sum()
    }

    /// Count one more occurrence of `cause`. Returns the new count of the
    /// entry it was merged into.
    pub fn record(&mut self, cause: &str, at: DateTime<Utc>) -> Result<u32, HistoryError> {
        let words = keywords(cause);
        if words.is_empty() {
            return Ok(0);
        }
        let count = match self.best_match(&words) {
            Some(i) => {
                let entry = &mut self.entries[i];
                entry.occurrences += 1;
                entry.last_seen = at;
                entry.occurrences
            }
            None => {
                self.entries.push(RootCauseEntry {
                    cause: cause.to_string(),
                    keywords: words,
                    occurrences: 1,
                    first_seen: at,
                    last_seen: at,
                });
                1
            }
        };
        write_json(&self.path, &self.entries)?;
        Ok(count)
    }
}
