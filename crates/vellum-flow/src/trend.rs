//! Trend authority store.
//!
//! Keywords earn authority by being observed in consecutive refresh
//! windows and lose it by decaying after a day without observation. The
//! store is persisted whole on every mutation and survives restarts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use vellum_core::error::Result;
use vellum_core::jsonio;

/// Derived rank of a trend keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendAuthority {
    /// Observed in three or more consecutive windows.
    Established,
    /// Observed in two consecutive windows.
    Emerging,
    /// Observed once.
    Fleeting,
}

/// One tracked keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendEntry {
    /// The keyword itself.
    pub keyword: String,
    /// First observation time.
    pub first_seen: DateTime<Utc>,
    /// Most recent observation time.
    pub last_seen: DateTime<Utc>,
    /// Consecutive refresh windows the keyword appeared in; at least 1.
    pub consecutive_windows: u32,
}

impl TrendEntry {
    /// The derived authority rank.
    #[must_use]
    pub const fn authority(&self) -> TrendAuthority {
        match self.consecutive_windows {
            0 | 1 => TrendAuthority::Fleeting,
            2 => TrendAuthority::Emerging,
            _ => TrendAuthority::Established,
        }
    }
}

/// The injected trend data source.
#[async_trait]
pub trait TrendSource: Send + Sync {
    /// Fetches raw trend candidates for a topic.
    async fn fetch(&self, topic: &str) -> Result<Vec<String>>;
}

/// A fixed-candidate source for mock mode and tests.
pub struct StaticTrendSource {
    candidates: Vec<String>,
}

impl StaticTrendSource {
    /// Creates a source always returning the given candidates.
    #[must_use]
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl TrendSource for StaticTrendSource {
    async fn fetch(&self, _topic: &str) -> Result<Vec<String>> {
        Ok(self.candidates.clone())
    }
}

/// Store configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrendConfig {
    /// Re-observation after this gap counts a new consecutive window.
    pub refresh_window: Duration,
    /// Entries unobserved past this lose one window per decay pass.
    pub decay_threshold: Duration,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            refresh_window: Duration::from_secs(6 * 3600),
            decay_threshold: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrendFile {
    entries: BTreeMap<String, TrendEntry>,
}

/// Persistent trend authority store.
pub struct TrendStore {
    config: TrendConfig,
    path: PathBuf,
    source: Arc<dyn TrendSource>,
    entries: Mutex<BTreeMap<String, TrendEntry>>,
}

impl TrendStore {
    /// Opens the store, loading any persisted entries.
    #[must_use]
    pub fn new(path: PathBuf, config: TrendConfig, source: Arc<dyn TrendSource>) -> Self {
        let entries = jsonio::read_json::<TrendFile>(&path)
            .map(|f| f.entries)
            .unwrap_or_default();
        Self {
            config,
            path,
            source,
            entries: Mutex::new(entries),
        }
    }

    /// Returns hot candidates for a topic, ranked by derived authority.
    ///
    /// Runs the decay pass, fetches candidates from the injected source
    /// (source failures degrade to an empty list), promotes observations
    /// and persists.
    ///
    /// # Errors
    ///
    /// Returns persistence failures only.
    pub async fn get_hot(&self, topic: &str) -> Result<Vec<TrendEntry>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        Self::decay(&mut entries, now, self.config.decay_threshold);

        let candidates = match self.source.fetch(topic).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(topic, error = %e, "trend source failed; continuing without candidates");
                Vec::new()
            }
        };

        let refresh =
            chrono::Duration::from_std(self.config.refresh_window).unwrap_or_else(|_| {
                chrono::Duration::hours(6)
            });
        for keyword in &candidates {
            match entries.get_mut(keyword) {
                None => {
                    entries.insert(
                        keyword.clone(),
                        TrendEntry {
                            keyword: keyword.clone(),
                            first_seen: now,
                            last_seen: now,
                            consecutive_windows: 1,
                        },
                    );
                }
                Some(entry) => {
                    if now.signed_duration_since(entry.last_seen) >= refresh {
                        entry.consecutive_windows += 1;
                    }
                    entry.last_seen = now;
                }
            }
        }

        self.persist(&entries)?;

        let mut hot: Vec<TrendEntry> = candidates
            .iter()
            .filter_map(|k| entries.get(k).cloned())
            .collect();
        hot.sort_by(|a, b| {
            a.authority()
                .cmp(&b.authority())
                .then_with(|| a.keyword.cmp(&b.keyword))
        });
        Ok(hot)
    }

    /// Keywords currently at established authority.
    pub async fn established(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.authority() == TrendAuthority::Established)
            .map(|e| e.keyword.clone())
            .collect()
    }

    /// A snapshot of every tracked entry (observability).
    pub async fn entries(&self) -> Vec<TrendEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Runs only the decay pass and persists; used by maintenance sweeps.
    ///
    /// # Errors
    ///
    /// Returns persistence failures only.
    pub async fn decay_pass(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        Self::decay(&mut entries, Utc::now(), self.config.decay_threshold);
        self.persist(&entries)
    }

    fn decay(
        entries: &mut BTreeMap<String, TrendEntry>,
        now: DateTime<Utc>,
        threshold: Duration,
    ) {
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        entries.retain(|_, entry| {
            if now.signed_duration_since(entry.last_seen) > threshold {
                // One decrement per pass; the entry leaves the map the
                // moment it would reach zero.
                if entry.consecutive_windows <= 1 {
                    return false;
                }
                entry.consecutive_windows -= 1;
                // Restart the decay clock so each further threshold costs
                // one more window.
                entry.last_seen += threshold;
            }
            true
        });
    }

    fn persist(&self, entries: &BTreeMap<String, TrendEntry>) -> Result<()> {
        jsonio::write_json_atomic(
            &self.path,
            &TrendFile {
                entries: entries.clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(dir: &std::path::Path, candidates: Vec<&str>) -> TrendStore {
        TrendStore::new(
            dir.join("trends_authority.json"),
            TrendConfig::default(),
            Arc::new(StaticTrendSource::new(
                candidates.into_iter().map(String::from).collect(),
            )),
        )
    }

    #[tokio::test]
    async fn first_observation_creates_fleeting_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), vec!["rust", "wasm"]);
        let hot = store.get_hot("systems").await.unwrap();
        assert_eq!(hot.len(), 2);
        assert!(hot.iter().all(|e| e.authority() == TrendAuthority::Fleeting));
        assert!(hot.iter().all(|e| e.consecutive_windows == 1));
    }

    #[tokio::test]
    async fn reobservation_within_refresh_window_does_not_promote() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), vec!["rust"]);
        store.get_hot("t").await.unwrap();
        store.get_hot("t").await.unwrap();
        let entries = store.entries().await;
        assert_eq!(entries[0].consecutive_windows, 1);
    }

    #[tokio::test]
    async fn reobservation_past_refresh_window_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), vec!["rust"]);
        store.get_hot("t").await.unwrap();

        {
            let mut entries = store.entries.lock().await;
            let entry = entries.get_mut("rust").unwrap();
            entry.last_seen = Utc::now() - chrono::Duration::hours(7);
        }

        store.get_hot("t").await.unwrap();
        let entries = store.entries().await;
        assert_eq!(entries[0].consecutive_windows, 2);
        assert_eq!(entries[0].authority(), TrendAuthority::Emerging);
    }

    #[tokio::test]
    async fn decay_decrements_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), vec![]);
        {
            let mut entries = store.entries.lock().await;
            entries.insert(
                "fading".into(),
                TrendEntry {
                    keyword: "fading".into(),
                    first_seen: Utc::now() - chrono::Duration::days(10),
                    last_seen: Utc::now() - chrono::Duration::hours(25),
                    consecutive_windows: 2,
                },
            );
            entries.insert(
                "gone".into(),
                TrendEntry {
                    keyword: "gone".into(),
                    first_seen: Utc::now() - chrono::Duration::days(10),
                    last_seen: Utc::now() - chrono::Duration::hours(25),
                    consecutive_windows: 1,
                },
            );
        }

        store.decay_pass().await.unwrap();
        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].keyword, "fading");
        assert_eq!(entries[0].consecutive_windows, 1);
    }

    #[tokio::test]
    async fn multiple_thresholds_cost_multiple_windows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), vec![]);
        {
            let mut entries = store.entries.lock().await;
            entries.insert(
                "old".into(),
                TrendEntry {
                    keyword: "old".into(),
                    first_seen: Utc::now() - chrono::Duration::days(30),
                    last_seen: Utc::now() - chrono::Duration::hours(49),
                    consecutive_windows: 3,
                },
            );
        }

        // Two decay passes: ~49h unobserved crosses the 24h threshold twice.
        store.decay_pass().await.unwrap();
        store.decay_pass().await.unwrap();
        let entries = store.entries().await;
        assert_eq!(entries[0].consecutive_windows, 1);
    }

    #[tokio::test]
    async fn ranking_is_established_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), vec!["new", "veteran"]);
        {
            let mut entries = store.entries.lock().await;
            entries.insert(
                "veteran".into(),
                TrendEntry {
                    keyword: "veteran".into(),
                    first_seen: Utc::now() - chrono::Duration::days(5),
                    last_seen: Utc::now() - chrono::Duration::hours(1),
                    consecutive_windows: 4,
                },
            );
        }

        let hot = store.get_hot("t").await.unwrap();
        assert_eq!(hot[0].keyword, "veteran");
        assert_eq!(hot[0].authority(), TrendAuthority::Established);
        assert_eq!(hot[1].keyword, "new");
    }

    #[tokio::test]
    async fn store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store_with(dir.path(), vec!["persisted"]);
            store.get_hot("t").await.unwrap();
        }
        let reopened = store_with(dir.path(), vec![]);
        let entries = reopened.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].keyword, "persisted");
    }

    struct FailingSource;

    #[async_trait]
    impl TrendSource for FailingSource {
        async fn fetch(&self, _topic: &str) -> Result<Vec<String>> {
            Err(vellum_core::error::Error::Network {
                message: "trend source down".into(),
            })
        }
    }

    #[tokio::test]
    async fn source_failure_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrendStore::new(
            dir.path().join("trends_authority.json"),
            TrendConfig::default(),
            Arc::new(FailingSource),
        );
        let hot = store.get_hot("t").await.unwrap();
        assert!(hot.is_empty());
    }
}
