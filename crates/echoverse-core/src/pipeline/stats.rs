//! Wall-clock statistics per strategy and document size.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::strategy::ProcessingStrategy;

/// Documents are grouped in buckets of this many characters.
const BUCKET_CHARS: usize = 100;

/// Samples kept per bucket.
const MAX_SAMPLES: usize = 10;

/// Aggregated timings for one (strategy, length bucket) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsEntry {
    pub strategy: ProcessingStrategy,
    /// First character count of the bucket (0, 100, 200, ...).
    pub length_bucket: usize,
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

#[derive(Default)]
pub struct PerformanceStats {
    samples: Mutex<HashMap<(ProcessingStrategy, usize), VecDeque<Duration>>>,
}

impl PerformanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, strategy: ProcessingStrategy, length: usize, elapsed: Duration) {
        let bucket = length / BUCKET_CHARS * BUCKET_CHARS;
        let mut samples = self.samples.lock().await;
        let window = samples.entry((strategy, bucket)).or_default();
        if window.len() == MAX_SAMPLES {
            window.pop_front();
        }
        window.push_back(elapsed);
    }

    /// One entry per bucket, ordered by strategy then bucket.
    pub async fn report(&self) -> Vec<StatsEntry> {
        let samples = self.samples.lock().await;
        let mut entries: Vec<StatsEntry> = samples
            .iter()
            .filter(|(_, window)| !window.is_empty())
            .map(|(&(strategy, length_bucket), window)| {
                let ms: Vec<u64> = window.iter().map(|d| d.as_millis() as u64).collect();
                StatsEntry {
                    strategy,
                    length_bucket,
                    count: ms.len(),
                    avg_ms: ms.iter().sum::<u64>() as f64 / ms.len() as f64,
                    min_ms: ms.iter().copied().min().unwrap_or(0),
                    max_ms: ms.iter().copied().max().unwrap_or(0),
                }
            })
            .collect();
        entries.sort_by_key(|e| (e.strategy, e.length_bucket));
        entries
    }

    pub async fn clear(&self) {
        self.samples.lock().await.clear();
    }
}
