//! Content-hash duplicate detection over processed inputs.
//!
//! Lookups go size-first: a file whose size is absent from the index can
//! be declared new without hashing. Matching sizes fall through to a
//! block-streamed SHA-256 digest. The index is persisted whole and capped
//! by a cleanup pass.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};

use vellum_core::error::{Error, Result};
use vellum_core::id::ProjectId;
use vellum_core::jsonio;

/// One processed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    /// SHA-256 of the file content, lowercase hex.
    pub hash: String,
    /// File size in bytes.
    pub size: u64,
    /// The project the input produced.
    pub project_id: ProjectId,
    /// When the input was processed.
    pub processed_at: DateTime<Utc>,
    /// The path the input was processed from.
    pub path: PathBuf,
}

/// How a duplicate check was decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMethod {
    /// No indexed entry shares the file's size.
    SizeMismatch,
    /// A same-size entry existed but the digest differed.
    HashMismatch,
    /// The digest matched an indexed entry.
    HashMatch,
}

/// Result of a duplicate check.
#[derive(Debug, Clone)]
pub struct ProcessedCheck {
    /// True when the file was processed before.
    pub processed: bool,
    /// How the decision was reached.
    pub method: CheckMethod,
    /// The matching entry, on a hash match.
    pub existing: Option<HashEntry>,
    /// The digest computed for the check, when hashing was needed.
    pub hash: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: BTreeMap<String, HashEntry>,
}

#[derive(Debug, Default)]
struct IndexState {
    by_hash: BTreeMap<String, HashEntry>,
    by_size: HashMap<u64, Vec<String>>,
}

impl IndexState {
    fn from_entries(entries: BTreeMap<String, HashEntry>) -> Self {
        let mut by_size: HashMap<u64, Vec<String>> = HashMap::new();
        for entry in entries.values() {
            by_size.entry(entry.size).or_default().push(entry.hash.clone());
        }
        Self {
            by_hash: entries,
            by_size,
        }
    }

    fn insert(&mut self, entry: HashEntry) {
        if let Some(previous) = self.by_hash.insert(entry.hash.clone(), entry.clone()) {
            if let Some(hashes) = self.by_size.get_mut(&previous.size) {
                hashes.retain(|h| h != &previous.hash);
            }
        }
        self.by_size.entry(entry.size).or_default().push(entry.hash);
    }

    fn remove(&mut self, hash: &str) {
        if let Some(entry) = self.by_hash.remove(hash) {
            if let Some(hashes) = self.by_size.get_mut(&entry.size) {
                hashes.retain(|h| h != hash);
                if hashes.is_empty() {
                    self.by_size.remove(&entry.size);
                }
            }
        }
    }
}

/// Persistent content-hash index.
pub struct HashIndex {
    path: PathBuf,
    state: Mutex<IndexState>,
    init: OnceCell<()>,
}

impl HashIndex {
    /// Creates an unloaded index; [`HashIndex::init`] loads it.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(IndexState::default()),
            init: OnceCell::new(),
        }
    }

    /// Loads persisted entries. Idempotent: concurrent callers share one
    /// load; later calls are no-ops.
    pub async fn init(&self) {
        self.init
            .get_or_init(|| async {
                let entries = jsonio::read_json::<IndexFile>(&self.path)
                    .map(|f| f.entries)
                    .unwrap_or_default();
                let loaded = entries.len();
                *self.state.lock().await = IndexState::from_entries(entries);
                tracing::debug!(entries = loaded, "hash index loaded");
            })
            .await;
    }

    /// Checks whether a file's content was processed before.
    ///
    /// # Errors
    ///
    /// Filesystem failures reading or hashing the file.
    pub async fn is_processed(&self, path: &Path) -> Result<ProcessedCheck> {
        self.init().await;
        let metadata = std::fs::metadata(path).map_err(|e| Error::filesystem(path, &e))?;
        let size = metadata.len();

        {
            let state = self.state.lock().await;
            if !state.by_size.contains_key(&size) {
                return Ok(ProcessedCheck {
                    processed: false,
                    method: CheckMethod::SizeMismatch,
                    existing: None,
                    hash: None,
                });
            }
        }

        let hash = hash_file(path)?;
        let state = self.state.lock().await;
        match state.by_hash.get(&hash) {
            Some(entry) => Ok(ProcessedCheck {
                processed: true,
                method: CheckMethod::HashMatch,
                existing: Some(entry.clone()),
                hash: Some(hash),
            }),
            None => Ok(ProcessedCheck {
                processed: false,
                method: CheckMethod::HashMismatch,
                existing: None,
                hash: Some(hash),
            }),
        }
    }

    /// Records a processed input and persists the index.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    pub async fn mark_processed(
        &self,
        path: &Path,
        hash: &str,
        size: u64,
        project_id: ProjectId,
    ) -> Result<()> {
        self.init().await;
        let mut state = self.state.lock().await;
        state.insert(HashEntry {
            hash: hash.to_string(),
            size,
            project_id,
            processed_at: Utc::now(),
            path: path.to_path_buf(),
        });
        self.persist(&state)
    }

    /// Removes age-expired entries, then LRU-trims to the cap.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    pub async fn cleanup(&self, max_age_days: i64, max_entries: usize) -> Result<usize> {
        self.init().await;
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);

        let mut stale: Vec<String> = state
            .by_hash
            .values()
            .filter(|e| e.processed_at < cutoff)
            .map(|e| e.hash.clone())
            .collect();
        for hash in &stale {
            state.remove(hash);
        }

        if state.by_hash.len() > max_entries {
            let mut by_age: Vec<(DateTime<Utc>, String)> = state
                .by_hash
                .values()
                .map(|e| (e.processed_at, e.hash.clone()))
                .collect();
            by_age.sort();
            let excess = state.by_hash.len() - max_entries;
            for (_, hash) in by_age.into_iter().take(excess) {
                state.remove(&hash);
                stale.push(hash);
            }
        }

        self.persist(&state)?;
        Ok(stale.len())
    }

    /// Number of indexed entries.
    pub async fn len(&self) -> usize {
        self.init().await;
        self.state.lock().await.by_hash.len()
    }

    /// True when nothing is indexed.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn persist(&self, state: &IndexState) -> Result<()> {
        jsonio::write_json_atomic(
            &self.path,
            &IndexFile {
                entries: state.by_hash.clone(),
            },
        )
    }
}

/// Block-streamed SHA-256 of a file, lowercase hex.
///
/// # Errors
///
/// Filesystem failures opening or reading the file.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::filesystem(path, &e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| Error::filesystem(path, &e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
