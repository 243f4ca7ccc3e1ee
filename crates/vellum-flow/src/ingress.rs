//! Document ingress: stable-write watching and pre-analysis.
//!
//! The watcher polls the incoming directory and considers a file ready
//! only after its size has held still for the configured window. Ready
//! files are analyzed (language, word count, reading time) and atomically
//! moved into the processed subtree *before* the ready event is
//! dispatched, so a downstream failure can never re-ingest the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use vellum_core::content::Language;
use vellum_core::error::{Error, Result};

use crate::metrics::names;

/// Extensions accepted from the incoming directory.
pub const ALLOWED_EXTENSIONS: &[&str] = &["md", "txt", "markdown"];

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Directory watched for documents.
    pub incoming_dir: PathBuf,
    /// Processed subtree files move into.
    pub processed_dir: PathBuf,
    /// Size must hold still this long before a file is ready.
    pub stable_window: Duration,
    /// Poll cadence.
    pub poll_interval: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            incoming_dir: PathBuf::from("incoming"),
            processed_dir: PathBuf::from("incoming/processed"),
            stable_window: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// A document ready for the pipeline.
#[derive(Debug, Clone)]
pub struct ReadyDocument {
    /// Post-move path inside the processed subtree.
    pub path: PathBuf,
    /// Document text.
    pub content: String,
    /// Detected language.
    pub language: Language,
    /// Word count under the language's counting rule.
    pub word_count: usize,
    /// Estimated reading time in seconds.
    pub reading_time_seconds: u64,
}

#[derive(Debug)]
struct PendingFile {
    size: u64,
    unchanged_since: Instant,
}

/// Stable-write directory watcher.
pub struct IngressWatcher {
    config: IngressConfig,
    tx: mpsc::Sender<ReadyDocument>,
    pending: HashMap<PathBuf, PendingFile>,
}

impl IngressWatcher {
    /// Creates a watcher dispatching ready documents into `tx`.
    #[must_use]
    pub fn new(config: IngressConfig, tx: mpsc::Sender<ReadyDocument>) -> Self {
        Self {
            config,
            tx,
            pending: HashMap::new(),
        }
    }

    /// Runs the poll loop until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "ingress poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("ingress watcher stopping");
                    return;
                }
            }
        }
    }

    /// One poll pass: track sizes, promote stable files.
    async fn poll_once(&mut self) -> Result<()> {
        let incoming = self.config.incoming_dir.clone();
        if !incoming.exists() {
            return Ok(());
        }

        let mut seen = Vec::new();
        let entries =
            std::fs::read_dir(&incoming).map_err(|e| Error::filesystem(&incoming, &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::filesystem(&incoming, &e))?;
            let path = entry.path();
            if !Self::accepts(&path) {
                continue;
            }
            let metadata = match std::fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            seen.push(path.clone());

            let size = metadata.len();
            let now = Instant::now();
            let pending = self
                .pending
                .entry(path.clone())
                .or_insert_with(|| PendingFile {
                    size,
                    unchanged_since: now,
                });
            if pending.size != size {
                pending.size = size;
                pending.unchanged_since = now;
                continue;
            }

            if now.duration_since(pending.unchanged_since) >= self.config.stable_window {
                self.pending.remove(&path);
                if let Err(e) = self.promote(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "document promotion failed");
                }
            }
        }

        // Forget files that vanished from the incoming dir.
        self.pending.retain(|path, _| seen.contains(path));
        Ok(())
    }

    /// Reads, analyzes, moves, then dispatches one ready file.
    async fn promote(&self, path: &Path) -> Result<()> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::filesystem(path, &e))?;
        let (language, word_count, reading_time_seconds) = analyze(&content);

        // Move before dispatch: a handler failure must not re-ingest.
        std::fs::create_dir_all(&self.config.processed_dir)
            .map_err(|e| Error::filesystem(&self.config.processed_dir, &e))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::storage(format!("path has no file name: {}", path.display())))?;
        let mut target = self.config.processed_dir.join(file_name);
        if target.exists() {
            let stem = target
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("document")
                .to_string();
            let ext = target
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or("md")
                .to_string();
            target = self
                .config
                .processed_dir
                .join(format!("{stem}_{}.{ext}", chrono::Utc::now().timestamp_millis()));
        }
        std::fs::rename(path, &target).map_err(|e| Error::filesystem(path, &e))?;

        counter!(names::DOCUMENTS_INGESTED_TOTAL, "language" => language.as_str()).increment(1);
        tracing::info!(
            path = %target.display(),
            language = language.as_str(),
            word_count,
            reading_time_seconds,
            "document ready"
        );

        let document = ReadyDocument {
            path: target,
            content,
            language,
            word_count,
            reading_time_seconds,
        };
        if self.tx.send(document).await.is_err() {
            tracing::error!("ready-document channel closed; dropping dispatch");
        }
        Ok(())
    }

    fn accepts(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
    }
}

/// Classifies language and counts words.
///
/// A document whose CJK character ratio reaches 30% is treated as Chinese:
/// words are Han characters, read at 300 characters per minute. Everything
/// else is English: words are whitespace tokens, read at 200 words per
/// minute.
#[must_use]
pub fn analyze(content: &str) -> (Language, usize, u64) {
    let mut total = 0usize;
    let mut cjk = 0usize;
    for ch in content.chars() {
        if ch.is_whitespace() {
            continue;
        }
        total += 1;
        if is_cjk(ch) {
            cjk += 1;
        }
    }

    let language = if total > 0 && cjk * 10 >= total * 3 {
        Language::Zh
    } else {
        Language::En
    };

    let word_count = match language {
        Language::Zh => cjk,
        Language::En => content.split_whitespace().count(),
    };

    let reading_time_seconds = match language {
        Language::Zh => (word_count as u64 * 60).div_ceil(300),
        Language::En => (word_count as u64 * 60).div_ceil(200),
    };

    (language, word_count, reading_time_seconds)
}

const fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3000}'..='\u{303F}'
        | '\u{FF00}'..='\u{FFEF}'
    )
}
