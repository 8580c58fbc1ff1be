//! Job, chunk result and progress event types.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::chunker::Chunk;
use crate::collaborators::{Tone, Voice};
use crate::document::Document;
use crate::error::{PipelineError, Warning};
use crate::fallback::FallbackDecision;
use crate::strategy::{ProcessingStrategy, SpeedQuality, StrategyPlan};

/// Identifier handed out by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a job.
///
/// `Pending -> Selecting -> (ShortCircuit | Chunking) -> Running ->
/// Reassembling -> Completed`, with `Failed` and `Cancelled` reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Selecting,
    ShortCircuit,
    Chunking,
    Running,
    Reassembling,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (Pending, Selecting)
            | (Selecting, ShortCircuit | Chunking)
            | (ShortCircuit | Chunking, Running)
            | (Running, Reassembling)
            | (Reassembling, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Selecting => "selecting",
            JobState::ShortCircuit => "short_circuit",
            JobState::Chunking => "chunking",
            JobState::Running => "running",
            JobState::Reassembling => "reassembling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Requested,
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Rewriting,
    Synthesizing,
    Done,
    Failed,
}

impl ChunkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Outcome of one chunk. Written once by the worker that owns the chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub rewritten_text: String,
    #[serde(skip)]
    pub audio: Bytes,
    pub state: ChunkState,
    pub warnings: Vec<Warning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub decisions: Vec<FallbackDecision>,
    pub from_cache: bool,
}

impl ChunkResult {
    pub fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            rewritten_text: String::new(),
            audio: Bytes::new(),
            state: ChunkState::Pending,
            warnings: Vec::new(),
            error: None,
            decisions: Vec::new(),
            from_cache: false,
        }
    }

    /// True when some fallback shaped this chunk's output.
    pub fn is_degraded(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| !matches!(w, Warning::ChunkingDegraded { .. }))
    }
}

/// A unit of work, owned by the task driving it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub document: Document,
    pub tone: Tone,
    pub voice: Voice,
    pub preference: SpeedQuality,
    pub strategy: Option<ProcessingStrategy>,
    pub chunks: Vec<Chunk>,
    pub chunk_results: Vec<ChunkResult>,
    pub state: JobState,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(document: Document, tone: Tone, voice: Voice, preference: SpeedQuality) -> Self {
        Self {
            id: JobId::new(),
            document,
            tone,
            voice,
            preference,
            strategy: None,
            chunks: Vec::new(),
            chunk_results: Vec::new(),
            state: JobState::Pending,
            cancel_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// Completed chunk count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f32,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            completed as f32 * 100.0 / total as f32
        };
        Self {
            completed,
            total,
            percent,
        }
    }
}

/// Events streamed to subscribers, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StateChanged {
        state: JobState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<CancelReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<PipelineError>,
    },
    StrategySelected {
        plan: StrategyPlan,
    },
    ChunksCreated {
        total: usize,
        degraded_cuts: Vec<usize>,
    },
    /// A chunk reached `Done` or `Failed`.
    ChunkFinished {
        chunk_index: usize,
        state: ChunkState,
        from_cache: bool,
        /// The chunk's text as it will appear in the output, for streaming
        /// consumers.
        rewritten_text: String,
        progress: Progress,
    },
    Progress(Progress),
}

impl ProgressEvent {
    pub fn state(state: JobState) -> Self {
        Self::StateChanged {
            state,
            reason: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StateChanged { state, .. } if state.is_terminal())
    }

    /// Progress carried by this event, if any.
    pub fn progress(&self) -> Option<Progress> {
        match self {
            Self::ChunkFinished { progress, .. } | Self::Progress(progress) => Some(*progress),
            _ => None,
        }
    }
}

/// Final result of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutput {
    pub job_id: JobId,
    pub plan: StrategyPlan,
    pub rewritten_text: String,
    #[serde(skip)]
    pub audio: Bytes,
    pub chunks: Vec<ChunkResult>,
    pub warnings: Vec<Warning>,
    pub elapsed_ms: u64,
}

impl JobOutput {
    pub fn strategy(&self) -> ProcessingStrategy {
        self.plan.strategy
    }

    /// Some chunks are `Failed`.
    pub fn is_partial(&self) -> bool {
        self.chunks.iter().any(|c| c.state == ChunkState::Failed)
    }

    /// Every chunk was served from the cache.
    pub fn fully_cached(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.from_cache)
    }
}
