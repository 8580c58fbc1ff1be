//! Per-chunk result cache.
//!
//! Keys are [`Fingerprint`]s over the normalized chunk text and the
//! parameters that shape the output. Values are complete
//! [`CacheEntry`]s: an entry is inserted whole under the write lock, so a
//! reader sees either nothing or the full entry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::collaborators::{Tone, Voice};
use crate::strategy::ProcessingStrategy;

/// Stable hash over `(normalized text, tone, voice, strategy)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn new(text: &str, tone: Tone, voice: Voice, strategy: ProcessingStrategy) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(Self::normalize(text).as_bytes());
        hasher.update(b"\0");
        hasher.update(tone.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(voice.name().as_bytes());
        hasher.update(b"\0");
        hasher.update(strategy.to_string().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Collapse whitespace runs to single spaces and trim the ends.
    pub fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&blake3::Hash::from(self.0).to_hex())
    }
}

/// A cached chunk result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Rewritten chunk body, without surrounding whitespace.
    pub rewritten_text: String,
    pub audio: Bytes,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(rewritten_text: impl Into<String>, audio: Bytes) -> Self {
        Self {
            rewritten_text: rewritten_text.into(),
            audio,
            created_at: Utc::now(),
        }
    }
}

/// Shared memo of chunk results.
///
/// Implementations must allow concurrent `get`s and make each `put` atomic.
/// `put` is last-write-wins.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Option<CacheEntry>;

    async fn put(&self, key: Fingerprint, entry: CacheEntry);

    async fn clear(&self);

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Unbounded session cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    async fn put(&self, key: Fingerprint, entry: CacheEntry) {
        self.entries.write().await.insert(key, entry);
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[derive(Default)]
struct LruState {
    entries: HashMap<Fingerprint, (CacheEntry, u64)>,
    /// Recency stamp -> key, oldest first.
    order: BTreeMap<u64, Fingerprint>,
    clock: u64,
}

impl LruState {
    fn touch(&mut self, key: &Fingerprint) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some((_, old)) = self.entries.get_mut(key) {
            self.order.remove(old);
            *old = stamp;
            self.order.insert(stamp, *key);
        }
    }
}

/// Cache with a capacity bound, evicting the least recently used entry.
pub struct BoundedCache {
    capacity: usize,
    state: RwLock<LruState>,
}

impl BoundedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(LruState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl ResultCache for BoundedCache {
    async fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        let mut state = self.state.write().await;
        let entry = state.entries.get(key).map(|(entry, _)| entry.clone())?;
        state.touch(key);
        Some(entry)
    }

    async fn put(&self, key: Fingerprint, entry: CacheEntry) {
        let mut state = self.state.write().await;
        state.clock += 1;
        let stamp = state.clock;

        if let Some((_, old)) = state.entries.insert(key, (entry, stamp)) {
            state.order.remove(&old);
        }
        state.order.insert(stamp, key);

        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            tracing::debug!(fingerprint = %oldest, "Evicted cache entry");
        }
    }

    async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.order.clear();
    }

    async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}
