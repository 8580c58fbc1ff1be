//! Adaptive processing pipeline.
//!
//! # Architecture
//!
//! ```text
//! submit(text, tone, voice, preference)
//!       │
//!       ▼
//!   Selecting ── validate, pick strategy
//!       │
//!   ┌───┴──────────────────┐
//!   ▼                      ▼
//! ShortCircuit          Chunking
//! (Micro, Express,      (Standard: one chunk,
//!  blank input)          Chunked/Progressive: Chunker)
//!   │                      │
//!   ▼                      ▼
//! Running: inline       Running: worker pool (N per job)
//!   │                      │   cache → rewrite → synthesize
//!   └──────────┬───────────┘   (each call via FallbackManager)
//!              ▼
//!        Reassembling ── concatenate in chunk order
//!              ▼
//!         Completed
//! ```
//!
//! Any state can end in `Failed` (rejected input) or `Cancelled` (explicit
//! cancel or the job deadline). Each job owns its chunks and results; the
//! result cache is the only state shared between workers and jobs.

mod progress;
mod stats;
#[cfg(test)]
mod tests;
mod types;
mod workers;

pub use progress::JobTracker;
pub use stats::{PerformanceStats, StatsEntry};
pub use types::{
    CancelReason, ChunkResult, ChunkState, Job, JobId, JobOutput, JobState, Progress,
    ProgressEvent,
};
pub use workers::ChunkParams;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cache::{BoundedCache, MemoryCache, ResultCache};
use crate::chunker::{Chunk, Chunker};
use crate::collaborators::{placeholder_clip, Rewriter, Synthesizer, Tone, Voice};
use crate::config::{ConfigError, PipelineConfig};
use crate::document::Document;
use crate::error::{PipelineError, Warning};
use crate::fallback::FallbackManager;
use crate::strategy::{self, ProcessingStrategy, SpeedQuality, StrategyPlan};

use workers::{lost_chunk, process_chunk, spawn_chunk_workers, SharedReceiver};

/// Everything a job needs, shared by all jobs of one processor.
pub(crate) struct PipelineContext {
    pub(crate) config: PipelineConfig,
    pub(crate) rewriter: Arc<dyn Rewriter>,
    pub(crate) synthesizer: Arc<dyn Synthesizer>,
    pub(crate) cache: Option<Arc<dyn ResultCache>>,
    pub(crate) fallback: FallbackManager,
    pub(crate) chunker: Chunker,
    pub(crate) placeholder: Option<Bytes>,
    pub(crate) stats: PerformanceStats,
}

type JobResult = Result<JobOutput, PipelineError>;

struct JobHandle {
    tracker: JobTracker,
    cancel: CancellationToken,
    result_rx: watch::Receiver<Option<JobResult>>,
}

/// Running jobs plus a bounded history of finished ones.
#[derive(Default)]
struct JobRegistry {
    handles: HashMap<JobId, JobHandle>,
    /// Finished jobs, oldest first.
    finished: VecDeque<JobId>,
}

impl JobRegistry {
    fn get(&self, id: JobId) -> Result<&JobHandle, PipelineError> {
        self.handles
            .get(&id)
            .ok_or(PipelineError::UnknownJob { job_id: id })
    }

    /// Record `id` as finished and forget the oldest finished jobs beyond
    /// `keep`.
    fn retire(&mut self, id: JobId, keep: usize) {
        self.finished.push_back(id);
        while self.finished.len() > keep {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            self.handles.remove(&oldest);
            tracing::debug!(job_id = %oldest, "Dropped finished job from history");
        }
    }

    fn remove(&mut self, id: JobId) {
        self.handles.remove(&id);
        self.finished.retain(|finished| *finished != id);
    }
}

/// Accepts documents and drives each one through the pipeline as a job.
pub struct Processor {
    ctx: Arc<PipelineContext>,
    jobs: Arc<RwLock<JobRegistry>>,
    // Parent of every job token
    shutdown: CancellationToken,
}

impl Processor {
    /// Create a processor with a session cache built from `config`.
    pub fn new(
        config: PipelineConfig,
        rewriter: Arc<dyn Rewriter>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Result<Self, ConfigError> {
        let cache: Option<Arc<dyn ResultCache>> = match config.cache_capacity {
            Some(capacity) => Some(Arc::new(BoundedCache::new(capacity))),
            None => Some(Arc::new(MemoryCache::new())),
        };
        Self::with_cache(config, rewriter, synthesizer, cache)
    }

    /// Create a processor using the given cache (e.g. one shared with other
    /// processors). Ignored when `cache_enabled` is false.
    pub fn with_cache(
        config: PipelineConfig,
        rewriter: Arc<dyn Rewriter>,
        synthesizer: Arc<dyn Synthesizer>,
        cache: Option<Arc<dyn ResultCache>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let ctx = PipelineContext {
            cache: if config.cache_enabled { cache } else { None },
            fallback: FallbackManager::new(config.fallback_policy()),
            chunker: Chunker::new(config.max_chunk_chars, config.overlap_chars),
            placeholder: placeholder_clip(config.placeholder_ms),
            stats: PerformanceStats::new(),
            rewriter,
            synthesizer,
            config,
        };

        tracing::info!(
            rewriter = ctx.rewriter.name(),
            synthesizer = ctx.synthesizer.name(),
            workers = ctx.config.worker_pool_size,
            cache = ctx.cache.is_some(),
            "Processor ready"
        );

        Ok(Self {
            ctx: Arc::new(ctx),
            jobs: Arc::new(RwLock::new(JobRegistry::default())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    /// Strategy plan `text` would get, without running anything.
    pub fn plan(&self, text: &str, preference: SpeedQuality) -> StrategyPlan {
        let length = text.chars().count();
        strategy::plan(&self.ctx.config.thresholds, length, preference)
    }

    /// Start a job and return its id immediately.
    pub async fn submit(
        &self,
        text: impl Into<String>,
        tone: Tone,
        voice: Voice,
        preference: SpeedQuality,
    ) -> JobId {
        self.start(text.into(), tone, voice, preference).await.0
    }

    async fn start(
        &self,
        text: String,
        tone: Tone,
        voice: Voice,
        preference: SpeedQuality,
    ) -> (JobId, watch::Receiver<Option<JobResult>>) {
        let job = Job::new(Document::new(text), tone, voice, preference);
        let id = job.id;
        let tracker = JobTracker::new(id);
        let cancel = self.shutdown.child_token();
        let (result_tx, result_rx) = watch::channel(None);

        self.jobs.write().await.handles.insert(
            id,
            JobHandle {
                tracker: tracker.clone(),
                cancel: cancel.clone(),
                result_rx: result_rx.clone(),
            },
        );

        tracing::info!(
            job_id = %id,
            chars = job.document.length(),
            tone = %tone,
            voice = %voice,
            "Job submitted"
        );

        tokio::spawn(drive(
            self.ctx.clone(),
            self.jobs.clone(),
            job,
            tracker,
            cancel,
            result_tx,
        ));
        (id, result_rx)
    }

    /// Progress events of a job, from the beginning, ending at its terminal
    /// state.
    pub async fn subscribe(
        &self,
        id: JobId,
    ) -> Result<BoxStream<'static, ProgressEvent>, PipelineError> {
        Ok(self.jobs.read().await.get(id)?.tracker.subscribe())
    }

    /// Request cancellation. No-op for finished jobs.
    pub async fn cancel(&self, id: JobId) -> Result<(), PipelineError> {
        let jobs = self.jobs.read().await;
        let handle = jobs.get(id)?;
        tracing::info!(job_id = %id, "Cancellation requested");
        handle.cancel.cancel();
        Ok(())
    }

    pub async fn state(&self, id: JobId) -> Result<JobState, PipelineError> {
        let tracker = self.jobs.read().await.get(id)?.tracker.clone();
        Ok(tracker.state().await)
    }

    /// Wait for a job to finish and return its output.
    ///
    /// Only the last `job_history` finished jobs can be queried.
    pub async fn result(&self, id: JobId) -> JobResult {
        let rx = self.jobs.read().await.get(id)?.result_rx.clone();
        wait_for_result(rx).await
    }

    /// Forget a finished job. Returns false if it is still running.
    pub async fn remove(&self, id: JobId) -> Result<bool, PipelineError> {
        let mut jobs = self.jobs.write().await;
        if !jobs.get(id)?.tracker.state().await.is_terminal() {
            return Ok(false);
        }
        jobs.remove(id);
        Ok(true)
    }

    /// Number of jobs currently known: running plus retained history.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.handles.len()
    }

    /// Submit and wait.
    pub async fn process(
        &self,
        text: impl Into<String>,
        tone: Tone,
        voice: Voice,
        preference: SpeedQuality,
    ) -> JobResult {
        // Hold on to the receiver: other jobs may push this one out of the
        // history before we look it up.
        let (_, rx) = self.start(text.into(), tone, voice, preference).await;
        wait_for_result(rx).await
    }

    /// Process several documents with bounded concurrency. Results are in
    /// input order.
    pub async fn process_batch(
        &self,
        texts: Vec<String>,
        tone: Tone,
        voice: Voice,
        preference: SpeedQuality,
    ) -> Vec<JobResult> {
        let concurrency = self.ctx.config.worker_pool_size;
        stream::iter(texts)
            .map(|text| self.process(text, tone, voice, preference))
            .buffered(concurrency)
            .collect()
            .await
    }

    pub async fn stats(&self) -> Vec<StatsEntry> {
        self.ctx.stats.report().await
    }

    /// Forget recorded timings, e.g. after the collaborators change.
    pub async fn clear_stats(&self) {
        self.ctx.stats.clear().await;
        tracing::info!("Performance statistics cleared");
    }

    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.ctx.cache {
            cache.clear().await;
            tracing::info!("Result cache cleared");
        }
    }

    /// Number of cached chunk results.
    pub async fn cache_len(&self) -> usize {
        match &self.ctx.cache {
            Some(cache) => cache.len().await,
            None => 0,
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run a job to its terminal state and publish the result.
async fn wait_for_result(mut rx: watch::Receiver<Option<JobResult>>) -> JobResult {
    let value = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| PipelineError::internal("job ended without a result"))?;
    match &*value {
        Some(result) => result.clone(),
        None => Err(PipelineError::internal("job ended without a result")),
    }
}

async fn drive(
    ctx: Arc<PipelineContext>,
    jobs: Arc<RwLock<JobRegistry>>,
    mut job: Job,
    tracker: JobTracker,
    cancel: CancellationToken,
    result_tx: watch::Sender<Option<JobResult>>,
) {
    let started = Instant::now();
    let outcome = run_job(&ctx, &mut job, &tracker, &cancel, started).await;

    let (state, reason, error) = match &outcome {
        Ok(output) => {
            ctx.stats
                .record(output.strategy(), job.document.length(), started.elapsed())
                .await;
            tracing::info!(
                job_id = %job.id,
                strategy = %output.strategy(),
                chunks = output.chunks.len(),
                warnings = output.warnings.len(),
                elapsed_ms = output.elapsed_ms,
                "Job completed"
            );
            (JobState::Completed, None, None)
        }
        Err(PipelineError::Cancelled) => {
            let reason = job.cancel_reason.unwrap_or(CancelReason::Requested);
            tracing::info!(job_id = %job.id, reason = ?reason, "Job cancelled");
            (JobState::Cancelled, Some(reason), None)
        }
        Err(e) if e.is_rejection() => {
            tracing::info!(job_id = %job.id, error = %e, "Job rejected");
            (JobState::Failed, None, Some(e.clone()))
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, error = %e, "Job failed");
            (JobState::Failed, None, Some(e.clone()))
        }
    };

    // Terminal state first, so `result()` returning implies a terminal `state()`.
    if let Err(e) = tracker.transition_with(state, reason, error).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to record final state");
    }
    job.state = state;
    jobs.write().await.retire(job.id, ctx.config.job_history);
    result_tx.send_replace(Some(outcome));
}

async fn advance(job: &mut Job, tracker: &JobTracker, next: JobState) -> Result<(), PipelineError> {
    tracker.transition(next).await?;
    job.state = next;
    Ok(())
}

async fn run_job(
    ctx: &Arc<PipelineContext>,
    job: &mut Job,
    tracker: &JobTracker,
    cancel: &CancellationToken,
    started: Instant,
) -> JobResult {
    let deadline = ctx
        .config
        .job_timeout()
        .map(|t| tokio::time::Instant::now() + t);

    if cancel.is_cancelled() {
        job.cancel_reason = Some(CancelReason::Requested);
        return Err(PipelineError::Cancelled);
    }

    advance(job, tracker, JobState::Selecting).await?;
    job.document.validate(ctx.config.max_document_chars)?;

    let plan = strategy::plan(
        &ctx.config.thresholds,
        job.document.length(),
        job.preference,
    );
    job.strategy = Some(plan.strategy);
    tracing::info!(
        job_id = %job.id,
        strategy = %plan.strategy,
        base = %plan.base_strategy,
        chars = plan.length,
        "Strategy selected"
    );
    tracker
        .emit(ProgressEvent::StrategySelected { plan: plan.clone() })
        .await;

    let blank = job.document.is_blank();
    let short_circuit = blank || plan.strategy.is_short_circuit();
    if short_circuit {
        advance(job, tracker, JobState::ShortCircuit).await?;
    } else {
        advance(job, tracker, JobState::Chunking).await?;
    }

    job.chunks = if blank {
        Vec::new()
    } else {
        match plan.strategy {
            ProcessingStrategy::Micro
            | ProcessingStrategy::Express
            | ProcessingStrategy::Standard => vec![Chunk::whole(&job.document)],
            ProcessingStrategy::Chunked | ProcessingStrategy::Progressive => {
                ctx.chunker.split(&job.document).collect()
            }
        }
    };
    let total = job.chunks.len();

    if !short_circuit {
        let degraded_cuts: Vec<usize> = job
            .chunks
            .iter()
            .filter(|c| c.degraded_cut)
            .map(|c| c.index)
            .collect();
        tracing::debug!(job_id = %job.id, chunks = total, degraded = degraded_cuts.len(), "Document chunked");
        tracker
            .emit(ProgressEvent::ChunksCreated {
                total,
                degraded_cuts,
            })
            .await;
    }

    advance(job, tracker, JobState::Running).await?;
    tracker
        .emit(ProgressEvent::Progress(Progress::new(0, total)))
        .await;

    let params = ChunkParams {
        job_id: job.id,
        tone: job.tone,
        voice: job.voice,
        strategy: plan.strategy,
    };
    let finished = if short_circuit {
        run_inline(ctx, params, &job.chunks, tracker, cancel, deadline).await
    } else {
        run_pool(ctx, params, &job.chunks, tracker, cancel, deadline).await
    };

    match finished {
        Ok(results) => job.chunk_results = results,
        Err(reason) => {
            cancel.cancel();
            job.cancel_reason = Some(reason);
            return Err(PipelineError::Cancelled);
        }
    }

    advance(job, tracker, JobState::Reassembling).await?;
    Ok(assemble(job, plan, started))
}

/// Resolves when the job is cancelled or its deadline passes.
async fn interruption(
    cancel: &CancellationToken,
    deadline: Option<tokio::time::Instant>,
) -> CancelReason {
    match deadline {
        Some(at) => tokio::select! {
            _ = cancel.cancelled() => CancelReason::Requested,
            _ = tokio::time::sleep_until(at) => CancelReason::DeadlineExceeded,
        },
        None => {
            cancel.cancelled().await;
            CancelReason::Requested
        }
    }
}

/// Short-circuit path: process the (at most one) chunk directly.
async fn run_inline(
    ctx: &Arc<PipelineContext>,
    params: ChunkParams,
    chunks: &[Chunk],
    tracker: &JobTracker,
    cancel: &CancellationToken,
    deadline: Option<tokio::time::Instant>,
) -> Result<Vec<ChunkResult>, CancelReason> {
    let mut results = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let result = tokio::select! {
            biased;
            reason = interruption(cancel, deadline) => return Err(reason),
            result = process_chunk(ctx, params, chunk, cancel) => result,
        };
        results.push(result);
    }
    tracker
        .emit(ProgressEvent::Progress(Progress::new(chunks.len(), chunks.len())))
        .await;
    Ok(results)
}

/// Worker-pool path: results arrive in completion order and are slotted by
/// chunk index.
async fn run_pool(
    ctx: &Arc<PipelineContext>,
    params: ChunkParams,
    chunks: &[Chunk],
    tracker: &JobTracker,
    cancel: &CancellationToken,
    deadline: Option<tokio::time::Instant>,
) -> Result<Vec<ChunkResult>, CancelReason> {
    let total = chunks.len();

    let (work_tx, work_rx) = mpsc::unbounded_channel();
    for chunk in chunks {
        if work_tx.send(chunk.clone()).is_err() {
            break;
        }
    }
    drop(work_tx);

    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    spawn_chunk_workers(
        ctx.config.worker_pool_size.min(total),
        SharedReceiver::new_unbounded(work_rx),
        ctx.clone(),
        params,
        cancel.clone(),
        result_tx,
    );

    let mut slots: Vec<Option<ChunkResult>> = vec![None; total];
    let mut completed = 0;
    while completed < total {
        let received = tokio::select! {
            biased;
            reason = interruption(cancel, deadline) => return Err(reason),
            received = result_rx.recv() => received,
        };
        // All workers gone; missing chunks are filled in below.
        let Some(result) = received else {
            break;
        };

        completed += 1;
        tracing::debug!(
            job_id = %params.job_id,
            chunk_index = result.chunk_index,
            state = ?result.state,
            from_cache = result.from_cache,
            "Chunk finished"
        );
        tracker
            .emit(ProgressEvent::ChunkFinished {
                chunk_index: result.chunk_index,
                state: result.state,
                from_cache: result.from_cache,
                rewritten_text: result.rewritten_text.clone(),
                progress: Progress::new(completed, total),
            })
            .await;

        if let Some(slot) = slots.get_mut(result.chunk_index) {
            *slot = Some(result);
        }
    }

    Ok(slots
        .into_iter()
        .zip(chunks)
        .map(|(slot, chunk)| slot.unwrap_or_else(|| lost_chunk(chunk)))
        .collect())
}

/// Concatenate chunk results strictly in chunk order.
fn assemble(job: &Job, plan: StrategyPlan, started: Instant) -> JobOutput {
    let mut chunks = job.chunk_results.clone();
    chunks.sort_by_key(|c| c.chunk_index);

    let mut rewritten_text = String::new();
    let mut audio = BytesMut::new();
    for chunk in &chunks {
        rewritten_text.push_str(&chunk.rewritten_text);
        audio.extend_from_slice(&chunk.audio);
    }

    let mut warnings: Vec<Warning> = chunks
        .iter()
        .flat_map(|c| c.warnings.iter().cloned())
        .collect();
    let failed_chunks: Vec<usize> = chunks
        .iter()
        .filter(|c| c.state == ChunkState::Failed)
        .map(|c| c.chunk_index)
        .collect();
    if !failed_chunks.is_empty() {
        warnings.push(Warning::PartialOutput { failed_chunks });
    }

    JobOutput {
        job_id: job.id,
        plan,
        rewritten_text,
        audio: audio.freeze(),
        chunks,
        warnings,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
