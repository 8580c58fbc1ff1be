//! Pipeline tunables and persisted user settings.
//!
//! [`PipelineConfig`] is validated once when a processor is built.
//! [`Settings`] is the JSON file the CLI reads on startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::collaborators::{OpenAiConfig, Tone, Voice, SYNTHESIZER_INPUT_LIMIT};
use crate::fallback::FallbackPolicy;
use crate::strategy::{SpeedQuality, StrategyThresholds};

/// Absolute ceiling on document length, in characters.
pub const MAX_DOCUMENT_CHARS: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("strategy thresholds must be strictly increasing")]
    NonMonotonicThresholds,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("max_chunk_chars ({0}) must stay below the synthesizer input limit of {limit}", limit = SYNTHESIZER_INPUT_LIMIT)]
    ChunkTooLarge(usize),

    #[error("overlap_chars ({overlap}) must be smaller than max_chunk_chars ({max})")]
    OverlapTooLarge { overlap: usize, max: usize },

    /// A `Speed` preference can run a document this long as one chunk.
    #[error("chunked threshold ({0}) must stay below the synthesizer input limit of {limit}", limit = SYNTHESIZER_INPUT_LIMIT)]
    ThresholdTooLarge(usize),
}

/// Tunables of the processing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest chunk body, in characters.
    pub max_chunk_chars: usize,
    /// Context carried into each chunk from the previous one.
    pub overlap_chars: usize,
    /// Concurrent chunk workers per job.
    pub worker_pool_size: usize,
    /// Per-attempt budget for a collaborator call.
    pub call_budget_ms: u64,
    pub retry_count: u32,
    pub backoff_step_ms: u64,
    pub cache_enabled: bool,
    /// LRU bound for long-lived processors; unbounded when `None`.
    pub cache_capacity: Option<usize>,
    pub preference: SpeedQuality,
    pub max_document_chars: usize,
    /// Aggregate deadline after which a job is cancelled.
    pub job_timeout_ms: Option<u64>,
    /// Length of the placeholder clip; 0 disables it.
    pub placeholder_ms: u64,
    /// Finished jobs kept for `result`/`subscribe`; older ones are dropped.
    pub job_history: usize,
    pub thresholds: StrategyThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 400,
            overlap_chars: 0,
            worker_pool_size: 3,
            call_budget_ms: 10_000,
            retry_count: 2,
            backoff_step_ms: 250,
            cache_enabled: true,
            cache_capacity: None,
            preference: SpeedQuality::Balanced,
            max_document_chars: MAX_DOCUMENT_CHARS,
            job_timeout_ms: None,
            placeholder_ms: 500,
            job_history: 64,
            thresholds: StrategyThresholds::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.thresholds.is_monotonic() {
            return Err(ConfigError::NonMonotonicThresholds);
        }
        if self.thresholds.chunked >= SYNTHESIZER_INPUT_LIMIT {
            return Err(ConfigError::ThresholdTooLarge(self.thresholds.chunked));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Zero("worker_pool_size"));
        }
        if self.call_budget_ms == 0 {
            return Err(ConfigError::Zero("call_budget_ms"));
        }
        if self.max_chunk_chars == 0 {
            return Err(ConfigError::Zero("max_chunk_chars"));
        }
        if self.max_chunk_chars >= SYNTHESIZER_INPUT_LIMIT {
            return Err(ConfigError::ChunkTooLarge(self.max_chunk_chars));
        }
        if self.overlap_chars >= self.max_chunk_chars {
            return Err(ConfigError::OverlapTooLarge {
                overlap: self.overlap_chars,
                max: self.max_chunk_chars,
            });
        }
        if self.job_history == 0 {
            return Err(ConfigError::Zero("job_history"));
        }
        if self.cache_capacity == Some(0) {
            return Err(ConfigError::Zero("cache_capacity"));
        }
        Ok(())
    }

    pub fn call_budget(&self) -> Duration {
        Duration::from_millis(self.call_budget_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy {
            budget: self.call_budget(),
            retries: self.retry_count,
            backoff_step: Duration::from_millis(self.backoff_step_ms),
        }
    }
}

/// Persisted user settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub default_tone: Tone,
    pub default_voice: Voice,
    /// Remote collaborators; offline collaborators are used when absent.
    pub provider: Option<OpenAiConfig>,
}

impl Settings {
    /// Default location (`<config dir>/echoverse/settings.json`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("echoverse")
            .join("settings.json")
    }

    /// Load settings, falling back to defaults if the file is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::try_load(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load settings, using defaults");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read settings file")?;
        let settings = serde_json::from_str(&content).context("Failed to parse settings JSON")?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).context("Failed to write settings file")?;
        Ok(())
    }
}
