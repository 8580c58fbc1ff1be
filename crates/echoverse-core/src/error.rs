//! Error and warning taxonomy for the processing pipeline.
//!
//! Job-level failures are [`PipelineError`]s. Everything that goes wrong
//! inside a single chunk is a [`Warning`]: it is recorded on the job output
//! and never aborts sibling chunks.

use serde::Serialize;

use crate::fallback::FallbackApplied;
use crate::pipeline::JobId;

/// Errors that end a job (or a request against the processor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum PipelineError {
    /// Document exceeds the absolute size ceiling. Rejected before any work.
    #[error("document has {length} characters, above the {limit} character ceiling")]
    InputTooLarge { length: usize, limit: usize },

    /// Document cannot be processed at all.
    #[error("malformed document: {reason}")]
    MalformedDocument { reason: String },

    #[error("job {job_id} not found")]
    UnknownJob { job_id: JobId },

    /// User-initiated (or deadline-triggered) cancellation. Not a failure.
    #[error("job was cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the failures that are decided before any chunk work starts.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InputTooLarge { .. } | Self::MalformedDocument { .. }
        )
    }
}

/// Non-fatal conditions surfaced on a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The chunker had to cut inside a sentence.
    ChunkingDegraded { chunk_index: usize },
    /// The rewriter fallback produced this chunk's text.
    RewriteDegraded {
        chunk_index: usize,
        applied: FallbackApplied,
    },
    /// The synthesizer fallback produced (or shaped) this chunk's audio.
    SynthesisDegraded {
        chunk_index: usize,
        applied: FallbackApplied,
    },
    /// Neither the primary call nor its fallback produced output.
    FallbackExhausted { chunk_index: usize, reason: String },
    /// Aggregate: the job completed but some chunks are `Failed`.
    PartialOutput { failed_chunks: Vec<usize> },
}

impl Warning {
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Warning::ChunkingDegraded { chunk_index }
            | Warning::RewriteDegraded { chunk_index, .. }
            | Warning::SynthesisDegraded { chunk_index, .. }
            | Warning::FallbackExhausted { chunk_index, .. } => Some(*chunk_index),
            Warning::PartialOutput { .. } => None,
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::ChunkingDegraded { chunk_index } => {
                write!(f, "chunk {}: forced mid-sentence cut", chunk_index)
            }
            Warning::RewriteDegraded {
                chunk_index,
                applied,
            } => write!(f, "chunk {}: rewrite degraded ({})", chunk_index, applied),
            Warning::SynthesisDegraded {
                chunk_index,
                applied,
            } => write!(f, "chunk {}: synthesis degraded ({})", chunk_index, applied),
            Warning::FallbackExhausted {
                chunk_index,
                reason,
            } => write!(f, "chunk {}: no output produced: {}", chunk_index, reason),
            Warning::PartialOutput { failed_chunks } => {
                write!(f, "{} chunk(s) failed", failed_chunks.len())
            }
        }
    }
}
