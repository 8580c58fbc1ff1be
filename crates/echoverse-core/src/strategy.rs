//! Strategy selection.
//!
//! [`select`] is a pure, total function of document length and speed/quality
//! preference. Tiers are ordered by expected cost; a preference moves the
//! choice by at most one tier so a "maximum quality" request cannot blow the
//! latency budget.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Processing path, ordered from cheapest to most expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStrategy {
    /// Tiny input, one direct call.
    Micro,
    /// Short input, one direct call.
    Express,
    /// One chunk through the chunk pipeline.
    Standard,
    /// Several chunks through the worker pool.
    Chunked,
    /// Many chunks, progress streamed per chunk.
    Progressive,
}

impl ProcessingStrategy {
    pub const ALL: [ProcessingStrategy; 5] = [
        ProcessingStrategy::Micro,
        ProcessingStrategy::Express,
        ProcessingStrategy::Standard,
        ProcessingStrategy::Chunked,
        ProcessingStrategy::Progressive,
    ];

    /// Position in the cost ordering (Micro = 0).
    pub fn tier(self) -> usize {
        self as usize
    }

    fn from_tier(tier: usize) -> Self {
        Self::ALL[tier.min(Self::ALL.len() - 1)]
    }

    /// Strategies that skip chunking and make a single direct call.
    pub fn is_short_circuit(self) -> bool {
        matches!(self, Self::Micro | Self::Express)
    }

    /// Relative output quality the strategy is expected to deliver.
    pub fn quality_score(self) -> f32 {
        match self {
            Self::Micro => 0.3,
            Self::Express => 0.6,
            Self::Standard => 0.8,
            Self::Chunked => 0.85,
            Self::Progressive => 0.9,
        }
    }
}

impl std::fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Micro => write!(f, "micro"),
            Self::Express => write!(f, "express"),
            Self::Standard => write!(f, "standard"),
            Self::Chunked => write!(f, "chunked"),
            Self::Progressive => write!(f, "progressive"),
        }
    }
}

/// Caller's speed vs. quality trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedQuality {
    Speed,
    #[default]
    Balanced,
    Quality,
}

impl std::str::FromStr for SpeedQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "speed" => Ok(Self::Speed),
            "balanced" => Ok(Self::Balanced),
            "quality" => Ok(Self::Quality),
            other => Err(format!("unknown preference: {}", other)),
        }
    }
}

/// Upper length bounds (exclusive, in characters) for the first four tiers.
///
/// `Chunked` is inclusive of its bound; anything longer is `Progressive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyThresholds {
    pub micro: usize,
    pub express: usize,
    pub standard: usize,
    pub chunked: usize,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            micro: 50,
            express: 150,
            standard: 500,
            chunked: 2000,
        }
    }
}

impl StrategyThresholds {
    /// Bounds must be strictly increasing and non-zero.
    pub fn is_monotonic(&self) -> bool {
        0 < self.micro
            && self.micro < self.express
            && self.express < self.standard
            && self.standard < self.chunked
    }

    /// Tier chosen by length alone.
    pub fn base_strategy(&self, length: usize) -> ProcessingStrategy {
        if length < self.micro {
            ProcessingStrategy::Micro
        } else if length < self.express {
            ProcessingStrategy::Express
        } else if length < self.standard {
            ProcessingStrategy::Standard
        } else if length <= self.chunked {
            ProcessingStrategy::Chunked
        } else {
            ProcessingStrategy::Progressive
        }
    }
}

/// Select a strategy with the default thresholds.
pub fn select(length: usize, preference: SpeedQuality) -> ProcessingStrategy {
    select_with(&StrategyThresholds::default(), length, preference)
}

/// Select a strategy for `length` characters.
///
/// `Speed` downgrades Standard, Chunked and Progressive by one tier.
/// `Quality` upgrades Micro and Express by one tier. Empty input is always
/// `Micro`.
pub fn select_with(
    thresholds: &StrategyThresholds,
    length: usize,
    preference: SpeedQuality,
) -> ProcessingStrategy {
    if length == 0 {
        return ProcessingStrategy::Micro;
    }

    let base = thresholds.base_strategy(length);
    let tier = base.tier();
    match (preference, base) {
        (
            SpeedQuality::Speed,
            ProcessingStrategy::Standard
            | ProcessingStrategy::Chunked
            | ProcessingStrategy::Progressive,
        ) => ProcessingStrategy::from_tier(tier - 1),
        (SpeedQuality::Quality, ProcessingStrategy::Micro | ProcessingStrategy::Express) => {
            ProcessingStrategy::from_tier(tier + 1)
        }
        _ => base,
    }
}

/// Strategy decision plus the estimates used to report on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyPlan {
    pub strategy: ProcessingStrategy,
    /// What length alone would have chosen.
    pub base_strategy: ProcessingStrategy,
    pub length: usize,
    pub estimated_chunks: usize,
    #[serde(with = "duration_secs")]
    pub estimated_time: Duration,
    pub quality_score: f32,
}

/// Build the full plan for a document of `length` characters.
pub fn plan(
    thresholds: &StrategyThresholds,
    length: usize,
    preference: SpeedQuality,
) -> StrategyPlan {
    let strategy = select_with(thresholds, length, preference);
    let (estimated_chunks, estimated_time) = estimate(strategy, length);
    StrategyPlan {
        strategy,
        base_strategy: thresholds.base_strategy(length),
        length,
        estimated_chunks,
        estimated_time,
        quality_score: strategy.quality_score(),
    }
}

/// Rough (chunk count, wall-clock) estimate for running `strategy`.
pub fn estimate(strategy: ProcessingStrategy, length: usize) -> (usize, Duration) {
    let len = length as f64;
    match strategy {
        ProcessingStrategy::Micro => (1, Duration::from_millis(100)),
        ProcessingStrategy::Express => (1, Duration::from_secs_f64((len / 50.0).min(3.0))),
        ProcessingStrategy::Standard => (1, Duration::from_secs_f64((len / 30.0).min(8.0))),
        ProcessingStrategy::Chunked => {
            let chunks = (length / 200).max(1);
            (chunks, Duration::from_secs(4 * chunks as u64))
        }
        ProcessingStrategy::Progressive => {
            let chunks = (length / 150).max(1);
            (chunks, Duration::from_secs(3 * chunks as u64))
        }
    }
}

/// Every strategy whose estimate for `length` fits within `budget`.
pub fn alternatives_within(length: usize, budget: Duration) -> Vec<StrategyPlan> {
    let thresholds = StrategyThresholds::default();
    ProcessingStrategy::ALL
        .iter()
        .filter_map(|&strategy| {
            let (estimated_chunks, estimated_time) = estimate(strategy, length);
            (estimated_time <= budget).then(|| StrategyPlan {
                strategy,
                base_strategy: thresholds.base_strategy(length),
                length,
                estimated_chunks,
                estimated_time,
                quality_score: strategy.quality_score(),
            })
        })
        .collect()
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
