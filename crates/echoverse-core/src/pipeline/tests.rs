use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;

use super::*;
use crate::collaborators::{CollaboratorError, Locale};
use crate::fallback::FallbackApplied;

/// Identity rewriter that counts calls and can be slowed down.
#[derive(Default)]
struct EchoRewriter {
    calls: AtomicUsize,
    context_calls: AtomicUsize,
    delay: Duration,
    jitter_ms: u64,
    fail_all: bool,
}

impl EchoRewriter {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn jittery(jitter_ms: u64) -> Self {
        Self {
            jitter_ms,
            ..Default::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail_all: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn context_calls(&self) -> usize {
        self.context_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Rewriter for EchoRewriter {
    async fn rewrite(&self, text: &str, _tone: Tone) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut delay = self.delay;
        if self.jitter_ms > 0 {
            delay += Duration::from_millis(rand::rng().random_range(0..self.jitter_ms));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all {
            return Err(CollaboratorError::Transient("model overloaded".into()));
        }
        Ok(text.to_string())
    }

    async fn rewrite_in_context(
        &self,
        _context: &str,
        text: &str,
        tone: Tone,
    ) -> Result<String, CollaboratorError> {
        self.context_calls.fetch_add(1, Ordering::SeqCst);
        self.rewrite(text, tone).await
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Synthesizer returning the text bytes as "audio".
#[derive(Default)]
struct TextSynthesizer {
    calls: AtomicUsize,
    fail_all: bool,
    /// Fail every voice except the default one.
    default_voice_only: bool,
}

impl TextSynthesizer {
    fn failing() -> Self {
        Self {
            fail_all: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for TextSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: Voice,
        _locale: Locale,
    ) -> Result<Bytes, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all || (self.default_voice_only && voice != Voice::default()) {
            return Err(CollaboratorError::Transient("service unavailable".into()));
        }
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn name(&self) -> &'static str {
        "text"
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        call_budget_ms: 1_000,
        backoff_step_ms: 1,
        ..Default::default()
    }
}

fn processor(
    config: PipelineConfig,
    rewriter: &Arc<EchoRewriter>,
    synthesizer: &Arc<TextSynthesizer>,
) -> Processor {
    Processor::new(config, rewriter.clone(), synthesizer.clone()).unwrap()
}

/// Prose of at least `chars` characters made of short sentences.
fn prose(chars: usize) -> String {
    let mut text = String::new();
    let mut i = 0;
    while text.chars().count() < chars {
        text.push_str(&format!("Sentence {} walks over the rolling hills. ", i));
        if i % 4 == 3 {
            text.push_str("\n\n");
        }
        i += 1;
    }
    text.trim_end().to_string()
}

fn states(events: &[ProgressEvent]) -> Vec<JobState> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_empty_input_short_circuits_without_calls() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);

    let output = processor
        .process("", Tone::Neutral, Voice::Sarah, SpeedQuality::Quality)
        .await
        .unwrap();

    assert_eq!(output.strategy(), ProcessingStrategy::Micro);
    assert_eq!(output.rewritten_text, "");
    assert!(output.audio.is_empty());
    assert!(output.chunks.is_empty());
    assert_eq!(rewriter.calls(), 0);
    assert_eq!(synthesizer.calls(), 0);
}

#[tokio::test]
async fn test_micro_document_runs_inline() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);

    let id = processor
        .submit("Hello there.", Tone::Inspiring, Voice::Emma, SpeedQuality::Balanced)
        .await;
    let events: Vec<_> = processor.subscribe(id).await.unwrap().collect().await;
    let output = processor.result(id).await.unwrap();

    assert_eq!(
        states(&events),
        vec![
            JobState::Selecting,
            JobState::ShortCircuit,
            JobState::Running,
            JobState::Reassembling,
            JobState::Completed,
        ]
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::ChunksCreated { .. })));
    assert_eq!(output.rewritten_text, "Hello there.");
    assert_eq!(output.audio, Bytes::from_static(b"Hello there."));
    assert_eq!(rewriter.calls(), 1);
}

#[tokio::test]
async fn test_chunked_document_reassembles_in_order() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);
    let text = prose(1800);

    let output = processor
        .process(text.clone(), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();

    assert_eq!(output.strategy(), ProcessingStrategy::Chunked);
    assert!(output.chunks.len() >= 5);
    assert_eq!(output.rewritten_text, text);
    assert!(output.warnings.is_empty());
    for (i, chunk) in output.chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i);
        assert_eq!(chunk.state, ChunkState::Done);
    }
    assert_eq!(rewriter.calls(), output.chunks.len());
}

#[tokio::test]
async fn test_completion_order_does_not_affect_output() {
    let rewriter = Arc::new(EchoRewriter::jittery(20));
    let synthesizer = Arc::new(TextSynthesizer::default());
    let config = PipelineConfig {
        max_chunk_chars: 120,
        worker_pool_size: 4,
        cache_enabled: false,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);
    let text = prose(1500);

    for _ in 0..3 {
        let output = processor
            .process(text.clone(), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
            .await
            .unwrap();
        assert_eq!(output.rewritten_text, text);
        let indices: Vec<_> = output.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, (0..output.chunks.len()).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_failing_synthesizer_degrades_to_placeholder() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::failing());
    let processor = processor(fast_config(), &rewriter, &synthesizer);
    let text = prose(300);

    let output = processor
        .process(text.clone(), Tone::Suspenseful, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();

    assert_eq!(output.rewritten_text, text);
    assert!(!output.is_partial());
    assert!(!output.audio.is_empty());
    assert!(output.warnings.iter().any(|w| matches!(
        w,
        Warning::SynthesisDegraded {
            applied: FallbackApplied::ReturnedPlaceholder,
            ..
        }
    )));
    // One attempt plus two retries, no alternate for the default voice
    assert_eq!(synthesizer.calls(), 3);
    // Degraded results are not cached
    assert_eq!(processor.cache_len().await, 0);
}

#[tokio::test]
async fn test_exhausted_synthesis_fails_chunk_not_job() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::failing());
    let config = PipelineConfig {
        placeholder_ms: 0,
        retry_count: 0,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);
    let text = prose(900);

    let output = processor
        .process(text.clone(), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();

    assert!(output.is_partial());
    assert_eq!(output.rewritten_text, text);
    assert!(output
        .chunks
        .iter()
        .all(|c| c.state == ChunkState::Failed && c.error.is_some()));
    let expected: Vec<usize> = (0..output.chunks.len()).collect();
    assert!(output
        .warnings
        .contains(&Warning::PartialOutput { failed_chunks: expected }));
}

#[tokio::test]
async fn test_non_default_voice_switches_to_default() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer {
        default_voice_only: true,
        ..Default::default()
    });
    let config = PipelineConfig {
        retry_count: 0,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);

    let output = processor
        .process(prose(200), Tone::Neutral, Voice::James, SpeedQuality::Balanced)
        .await
        .unwrap();

    assert_eq!(output.chunks.len(), 1);
    let chunk = &output.chunks[0];
    assert_eq!(chunk.state, ChunkState::Done);
    assert_eq!(
        chunk.warnings,
        vec![Warning::SynthesisDegraded {
            chunk_index: 0,
            applied: FallbackApplied::SwitchedToDefaultVoice,
        }]
    );
    assert_eq!(synthesizer.calls(), 2);
}

#[tokio::test]
async fn test_cache_makes_repeat_jobs_free() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);
    let text = prose(200);

    let first = processor
        .process(text.clone(), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();
    let second = processor
        .process(text.clone(), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();

    assert!(!first.fully_cached());
    assert!(second.fully_cached());
    assert_eq!(first.rewritten_text, second.rewritten_text);
    assert_eq!(first.audio, second.audio);
    assert_eq!(rewriter.calls(), 1);
    assert_eq!(synthesizer.calls(), 1);

    // A different tone is a different fingerprint
    processor
        .process(text, Tone::Inspiring, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();
    assert_eq!(rewriter.calls(), 2);

    processor.clear_cache().await;
    assert_eq!(processor.cache_len().await, 0);
}

#[tokio::test]
async fn test_cancel_stops_remaining_chunks() {
    let rewriter = Arc::new(EchoRewriter::slow(Duration::from_millis(50)));
    let synthesizer = Arc::new(TextSynthesizer::default());
    let config = PipelineConfig {
        max_chunk_chars: 100,
        worker_pool_size: 1,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);

    let id = processor
        .submit(prose(550), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;
    let mut events = processor.subscribe(id).await.unwrap();
    while let Some(event) = events.next().await {
        if matches!(event, ProgressEvent::ChunkFinished { .. }) {
            processor.cancel(id).await.unwrap();
            break;
        }
    }

    let remaining: Vec<_> = events.collect().await;
    assert_eq!(
        remaining.last(),
        Some(&ProgressEvent::StateChanged {
            state: JobState::Cancelled,
            reason: Some(CancelReason::Requested),
            error: None,
        })
    );
    assert_eq!(processor.result(id).await, Err(PipelineError::Cancelled));
    assert_eq!(processor.state(id).await.unwrap(), JobState::Cancelled);
    assert!(rewriter.calls() <= 2);

    // Nothing else is dispatched after cancellation
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rewriter.calls() <= 2);
}

#[tokio::test]
async fn test_job_deadline_cancels() {
    let rewriter = Arc::new(EchoRewriter::slow(Duration::from_secs(2)));
    let synthesizer = Arc::new(TextSynthesizer::default());
    let config = PipelineConfig {
        job_timeout_ms: Some(100),
        call_budget_ms: 5_000,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);

    let id = processor
        .submit(prose(300), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;
    assert_eq!(processor.result(id).await, Err(PipelineError::Cancelled));

    let events: Vec<_> = processor.subscribe(id).await.unwrap().collect().await;
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::StateChanged {
            state: JobState::Cancelled,
            reason: Some(CancelReason::DeadlineExceeded),
            ..
        })
    ));
}

#[tokio::test]
async fn test_oversized_document_is_rejected() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let config = PipelineConfig {
        max_document_chars: 100,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);

    let id = processor
        .submit("x".repeat(150), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;
    let error = processor.result(id).await.unwrap_err();

    assert_eq!(
        error,
        PipelineError::InputTooLarge {
            length: 150,
            limit: 100
        }
    );
    assert!(error.is_rejection());
    assert_eq!(processor.state(id).await.unwrap(), JobState::Failed);
    let events: Vec<_> = processor.subscribe(id).await.unwrap().collect().await;
    assert_eq!(states(&events), vec![JobState::Selecting, JobState::Failed]);
    assert_eq!(rewriter.calls(), 0);
}

#[tokio::test]
async fn test_malformed_document_is_rejected() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);

    let result = processor
        .process("abc\0def", Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;
    assert!(matches!(
        result,
        Err(PipelineError::MalformedDocument { .. })
    ));
}

#[tokio::test]
async fn test_failing_rewriter_degrades_to_original() {
    let rewriter = Arc::new(EchoRewriter::failing());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);
    let text = prose(300);

    let output = processor
        .process(text.clone(), Tone::Inspiring, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();

    assert_eq!(output.strategy(), ProcessingStrategy::Standard);
    assert_eq!(output.rewritten_text, text);
    assert_eq!(output.chunks[0].state, ChunkState::Done);
    assert!(output.warnings.contains(&Warning::RewriteDegraded {
        chunk_index: 0,
        applied: FallbackApplied::ReturnedOriginal,
    }));
    assert!(rewriter.calls() > 1);
    // The original text still gets narrated.
    assert_eq!(synthesizer.calls(), 1);
    let narrated = text.split_whitespace().collect::<Vec<_>>().join(" ");
    assert_eq!(output.audio, Bytes::from(narrated));
    // Degraded results are not cached.
    assert_eq!(processor.cache_len().await, 0);
}

#[tokio::test]
async fn test_progressive_emits_incremental_progress() {
    let rewriter = Arc::new(EchoRewriter::jittery(10));
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);
    let text = prose(2600);

    let id = processor
        .submit(text.clone(), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;
    let events: Vec<_> = processor.subscribe(id).await.unwrap().collect().await;
    let output = processor.result(id).await.unwrap();

    assert_eq!(output.strategy(), ProcessingStrategy::Progressive);
    assert!(output.chunks.len() > 1);

    let finished: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ChunkFinished {
                chunk_index,
                rewritten_text,
                progress,
                ..
            } => Some((*chunk_index, rewritten_text.clone(), *progress)),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), output.chunks.len());

    for (n, (chunk_index, rewritten_text, progress)) in finished.iter().enumerate() {
        assert_eq!(progress.completed, n + 1);
        assert_eq!(progress.total, output.chunks.len());
        assert_eq!(rewritten_text, &output.chunks[*chunk_index].rewritten_text);
    }

    // Streamed pieces put back in chunk order give the final text.
    let mut pieces = finished.clone();
    pieces.sort_by_key(|(chunk_index, _, _)| *chunk_index);
    let streamed: String = pieces.into_iter().map(|(_, text, _)| text).collect();
    assert_eq!(streamed, text);
    assert_eq!(output.rewritten_text, text);
}

#[tokio::test]
async fn test_overlap_reassembles_through_processor() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let config = PipelineConfig {
        max_chunk_chars: 120,
        overlap_chars: 40,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);
    let text = prose(1200);

    let output = processor
        .process(text.clone(), Tone::Suspenseful, Voice::Sarah, SpeedQuality::Balanced)
        .await
        .unwrap();

    assert_eq!(output.strategy(), ProcessingStrategy::Chunked);
    assert!(output.chunks.len() > 5);
    assert_eq!(output.rewritten_text, text);
    assert!(output.chunks.iter().all(|c| c.state == ChunkState::Done));
    // Every chunk after the first is rewritten with the previous tail as context.
    assert_eq!(rewriter.calls(), output.chunks.len());
    assert_eq!(rewriter.context_calls(), output.chunks.len() - 1);
}

#[tokio::test]
async fn test_finished_jobs_beyond_history_are_forgotten() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let config = PipelineConfig {
        job_history: 2,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = processor
            .submit(
                format!("Short text number {}.", i),
                Tone::Neutral,
                Voice::Sarah,
                SpeedQuality::Balanced,
            )
            .await;
        processor.result(id).await.unwrap();
        ids.push(id);
    }

    assert_eq!(processor.job_count().await, 2);
    assert_eq!(
        processor.state(ids[0]).await,
        Err(PipelineError::UnknownJob { job_id: ids[0] })
    );
    assert_eq!(
        processor.result(ids[0]).await,
        Err(PipelineError::UnknownJob { job_id: ids[0] })
    );
    for id in &ids[1..] {
        assert_eq!(processor.state(*id).await, Ok(JobState::Completed));
        assert!(processor.result(*id).await.is_ok());
    }
}

#[tokio::test]
async fn test_batch_larger_than_history_still_returns_every_result() {
    let rewriter = Arc::new(EchoRewriter::jittery(5));
    let synthesizer = Arc::new(TextSynthesizer::default());
    let config = PipelineConfig {
        job_history: 1,
        ..fast_config()
    };
    let processor = processor(config, &rewriter, &synthesizer);
    let texts: Vec<String> = (0..8).map(|i| format!("Line {} of the batch.", i)).collect();

    let results = processor
        .process_batch(texts.clone(), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;

    assert_eq!(results.len(), texts.len());
    for (result, text) in results.iter().zip(&texts) {
        assert_eq!(&result.as_ref().unwrap().rewritten_text, text);
    }
    assert_eq!(processor.job_count().await, 1);
}

#[tokio::test]
async fn test_unknown_job() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);
    let id = JobId::new();

    assert_eq!(
        processor.result(id).await,
        Err(PipelineError::UnknownJob { job_id: id })
    );
    assert!(processor.cancel(id).await.is_err());
    assert!(processor.subscribe(id).await.is_err());
}

#[tokio::test]
async fn test_remove_only_finished_jobs() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);

    let id = processor
        .submit("Short text.", Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;
    processor.result(id).await.unwrap();

    assert_eq!(processor.remove(id).await, Ok(true));
    assert!(processor.state(id).await.is_err());
}

#[tokio::test]
async fn test_standard_job_event_sequence() {
    let rewriter = Arc::new(EchoRewriter::default());
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);

    let id = processor
        .submit(prose(300), Tone::Neutral, Voice::Sarah, SpeedQuality::Balanced)
        .await;
    let events: Vec<_> = processor.subscribe(id).await.unwrap().collect().await;

    assert_eq!(
        states(&events),
        vec![
            JobState::Selecting,
            JobState::Chunking,
            JobState::Running,
            JobState::Reassembling,
            JobState::Completed,
        ]
    );
    assert!(matches!(
        &events[1],
        ProgressEvent::StrategySelected { plan } if plan.strategy == ProcessingStrategy::Standard
    ));
    assert!(events.contains(&ProgressEvent::ChunksCreated {
        total: 1,
        degraded_cuts: vec![],
    }));
    let last_progress = events.iter().filter_map(|e| e.progress()).last().unwrap();
    assert_eq!(last_progress, Progress::new(1, 1));
}

#[tokio::test]
async fn test_batch_keeps_input_order() {
    let rewriter = Arc::new(EchoRewriter::jittery(10));
    let synthesizer = Arc::new(TextSynthesizer::default());
    let processor = processor(fast_config(), &rewriter, &synthesizer);
    let long = prose(200);

    let results = processor
        .process_batch(
            vec![String::new(), "Short one here.".to_string(), long.clone()],
            Tone::Neutral,
            Voice::Sarah,
            SpeedQuality::Balanced,
        )
        .await;

    let strategies: Vec<_> = results
        .iter()
        .map(|r| r.as_ref().unwrap().strategy())
        .collect();
    assert_eq!(
        strategies,
        vec![
            ProcessingStrategy::Micro,
            ProcessingStrategy::Micro,
            ProcessingStrategy::Standard,
        ]
    );
    assert_eq!(results[2].as_ref().unwrap().rewritten_text, long);

    let stats = processor.stats().await;
    assert!(stats
        .iter()
        .any(|s| s.strategy == ProcessingStrategy::Standard));

    processor.clear_stats().await;
    assert!(processor.stats().await.is_empty());
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = PipelineConfig {
        worker_pool_size: 0,
        ..Default::default()
    };
    let result = Processor::new(
        config,
        Arc::new(EchoRewriter::default()),
        Arc::new(TextSynthesizer::default()),
    );
    assert!(result.is_err());
}
