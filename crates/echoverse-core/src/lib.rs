//! EchoVerse Core - adaptive text-to-audiobook processing
//!
//! This crate contains the processing pipeline behind EchoVerse:
//! - Strategy selection by document length and speed/quality preference
//! - Sentence-safe chunking with optional context overlap
//! - Timeout, retry and degrade handling around every external call
//! - Per-chunk result caching
//! - Job orchestration with progress events and cancellation
//!
//! The rewriter and synthesizer are external collaborators behind the
//! [`Rewriter`] and [`Synthesizer`] traits.

pub mod cache;
pub mod chunker;
pub mod collaborators;
pub mod config;
pub mod document;
pub mod error;
pub mod fallback;
pub mod pipeline;
pub mod strategy;

pub use cache::{BoundedCache, CacheEntry, Fingerprint, MemoryCache, ResultCache};
pub use chunker::{Chunk, Chunker};
pub use collaborators::{Locale, Rewriter, Synthesizer, Tone, Voice};
pub use config::{PipelineConfig, Settings};
pub use document::Document;
pub use error::{PipelineError, Warning};
pub use fallback::{FallbackDecision, FallbackManager, FallbackPolicy};
pub use pipeline::{JobId, JobOutput, JobState, Processor, ProgressEvent};
pub use strategy::{ProcessingStrategy, SpeedQuality, StrategyPlan};
