//! Memory store: remember produced text and recall related entries for reply context.
//!
//! `MemoryStore` is the capability the scheduler consumes. `InMemoryStore` is the bundled
//! implementation: bounded, time-limited, ranked by word overlap with the query.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tokio::sync::RwLock;

/// One remembered piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub text: String,
    /// Where the entry came from (e.g. "group_chat", "autonomous_dialogue").
    pub source: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
    #[error("refusing to remember empty text")]
    EmptyText,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn remember(&self, entry: MemoryEntry) -> Result<(), MemoryError>;

    /// Up to `top_k` entries most related to `query`. Empty when nothing matches or the store is unavailable.
    async fn recall(&self, query: &str, top_k: usize) -> Vec<MemoryEntry>;
}

/// Bounded in-process store. Oldest entries go first when full or past retention.
pub struct InMemoryStore {
    entries: RwLock<VecDeque<MemoryEntry>>,
    max_entries: usize,
    retention: Option<ChronoDuration>,
}

impl InMemoryStore {
    /// `retention_hours == 0` keeps entries until evicted by size.
    pub fn new(max_entries: usize, retention_hours: u64) -> Self {
        let retention = (retention_hours > 0).then(|| ChronoDuration::hours(retention_hours as i64));
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries: max_entries.max(1),
            retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot of all entries, oldest first.
    pub async fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.read().await.iter().cloned().collect()
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Share of the query's words that also appear in the entry.
fn overlap(query: &HashSet<String>, text: &str) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let entry = words(text);
    let hits = query.iter().filter(|w| entry.contains(*w)).count();
    hits as f64 / query.len() as f64
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn remember(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        if entry.text.trim().is_empty() {
            return Err(MemoryError::EmptyText);
        }
        let mut g = self.entries.write().await;
        if let Some(retention) = self.retention {
            let cutoff = Utc::now() - retention;
            while g.front().is_some_and(|e| e.timestamp < cutoff) {
                g.pop_front();
            }
        }
        while g.len() >= self.max_entries {
            g.pop_front();
        }
        g.push_back(entry);
        Ok(())
    }

    async fn recall(&self, query: &str, top_k: usize) -> Vec<MemoryEntry> {
        if top_k == 0 {
            return Vec::new();
        }
        let query = words(query);
        let g = self.entries.read().await;
        let mut scored: Vec<(f64, usize)> = g
            .iter()
            .enumerate()
            .map(|(i, e)| (overlap(&query, &e.text), i))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        // Higher score first; newer entry wins ties.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        scored
            .into_iter()
            .take(top_k)
            .map(|(_, i)| g[i].clone())
            .collect()
    }
}
