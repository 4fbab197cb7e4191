//! Cache layout, the entry model, and state shared across operations.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::integrity::{Algorithm, Integrity};

mod content;
mod gc;
mod index;
mod rebuild;
mod verify;

#[cfg(test)]
mod tests;

const INDEX_DIR: &str = "index-v1";
const CONTENT_DIR: &str = "content-v1";
const TMP_DIR: &str = "tmp";
const LAST_VERIFIED_FILE: &str = "_lastverified";

/// Typed failures surfaced by the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache root {} is unusable: {source}", path.display())]
    RootUnusable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown digest algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("invalid integrity string '{0}'")]
    InvalidIntegrity(String),
    #[error("content at {} failed its integrity check", path.display())]
    IntegrityMismatch { path: PathBuf },
    #[error("verification cancelled")]
    Cancelled,
}

/// A parsed index record. Serialized field order is part of the bucket
/// format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    /// `None` marks a tombstone left by [`Cache::delete`].
    pub integrity: Option<String>,
    /// Insertion time in epoch milliseconds; the greatest time wins when a
    /// key has several records.
    pub time: u64,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Options accepted by [`Cache::put`].
#[derive(Clone, Debug)]
pub struct PutOptions {
    pub algorithm: Algorithm,
    pub metadata: Value,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Sha512,
            metadata: Value::Null,
        }
    }
}

/// Per-entry predicate deciding whether a parsed record stays in the
/// rebuilt index.
pub type EntryFilter = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Options accepted by [`Cache::verify`].
#[derive(Clone)]
pub struct VerifyOptions {
    /// Bound on parallel bucket verification and content-GC deletions.
    pub concurrency: usize,
    /// Per-entry predicate; entries it rejects are dropped from the
    /// rebuilt index.
    pub filter: Option<EntryFilter>,
    /// Cooperative cancellation flag, checked between phases and before
    /// each unit of parallel work.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            concurrency: 20,
            filter: None,
            cancel: None,
        }
    }
}

impl std::fmt::Debug for VerifyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyOptions")
            .field("concurrency", &self.concurrency)
            .field("filter", &self.filter.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Accounting returned by [`Cache::verify`]. The serialized names are the
/// API contract; times are epoch milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyStats {
    /// Distinct blobs that were re-checked and passed.
    pub verified_content: u64,
    /// Blobs deleted from the content store.
    pub reclaimed_count: u64,
    /// Byte sum of deleted blobs.
    pub reclaimed_size: u64,
    /// Blobs deleted because their bytes no longer matched their digest.
    pub bad_content_count: u64,
    /// Byte sum of retained blobs.
    pub kept_size: u64,
    /// Entries whose blob was absent or invalid.
    pub missing_content: u64,
    /// Entries removed from the index: filtered, shadowed, or missing
    /// content.
    pub rejected_entries: u64,
    /// Entries retained in the rebuilt index.
    pub total_entries: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub run_time: u64,
}

/// Content-addressed cache rooted at a directory.
#[derive(Clone, Debug)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Open (and lay out) a cache at `root`, or at the default location
    /// when `None` is supplied.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::RootUnusable`] when the directory tree
    /// cannot be created.
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(path) => path,
            None => default_root()?,
        };
        let cache = Self { root };
        cache.ensure_layout()?;
        Ok(cache)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn index_root(&self) -> PathBuf {
        self.root.join(INDEX_DIR)
    }

    pub(crate) fn content_root(&self) -> PathBuf {
        self.root.join(CONTENT_DIR)
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub(crate) fn ensure_layout(&self) -> Result<()> {
        for dir in [INDEX_DIR, CONTENT_DIR, TMP_DIR] {
            fs::create_dir_all(self.root.join(dir)).map_err(|source| CacheError::RootUnusable {
                path: self.root.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Remove now-empty directories bottom-up, leaving `root` itself.
    fn prune_empty_dirs(&self, root: &Path) -> Result<()> {
        if !root.exists() {
            return Ok(());
        }
        let mut dirs = Vec::new();
        for entry in WalkDir::new(root).min_depth(1) {
            let entry =
                entry.with_context(|| format!("failed to walk {} for pruning", root.display()))?;
            if entry.file_type().is_dir() {
                dirs.push(entry.path().to_path_buf());
            }
        }
        // remove_dir refuses non-empty directories, so children go first and
        // populated ones stay.
        for dir in dirs.iter().rev() {
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }
}

fn default_root() -> Result<PathBuf> {
    if let Some(path) = env::var_os("CASKET_CACHE_PATH") {
        return Ok(PathBuf::from(path));
    }
    if let Some(xdg) = env::var_os("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg).join("casket"));
    }
    let home = dirs_next::home_dir().context("failed to resolve HOME for the cache root")?;
    Ok(home.join(".cache").join("casket"))
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn hash_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Render one bucket record: leading newline, checksum, tab, payload.
fn format_record(payload: &str) -> String {
    format!("\n{}\t{}", Cache::hash_entry(payload), payload)
}

/// Parse bucket text, dropping torn or unparseable lines.
fn parse_bucket_lines(raw: &str) -> Vec<Entry> {
    let mut entries = Vec::new();
    for line in raw.split('\n') {
        if line.is_empty() {
            continue;
        }
        let Some((claimed, payload)) = line.split_once('\t') else {
            continue;
        };
        if Cache::hash_entry(payload) != claimed {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Entry>(payload) else {
            continue;
        };
        entries.push(entry);
    }
    entries
}

/// Bound worker fan-out by the configured concurrency and the job count.
fn worker_count(concurrency: usize, jobs: usize) -> usize {
    concurrency.clamp(1, 64).min(jobs.max(1))
}

fn is_cancelled(options: &VerifyOptions) -> bool {
    options
        .cancel
        .as_ref()
        .is_some_and(|flag| flag.load(Ordering::Relaxed))
}

fn check_cancelled(options: &VerifyOptions) -> Result<()> {
    if is_cancelled(options) {
        return Err(CacheError::Cancelled.into());
    }
    Ok(())
}
