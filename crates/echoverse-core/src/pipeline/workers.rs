//! Chunk worker pool.
//!
//! Each job gets its own small pool. Workers pull chunks from a shared
//! channel, run them through cache, rewriter and synthesizer, and send the
//! finished [`ChunkResult`] back to the job task. Cancellation is checked
//! before every dispatch.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, Fingerprint};
use crate::chunker::Chunk;
use crate::collaborators::{synthesis_input, Tone, Voice};
use crate::error::Warning;
use crate::fallback::{CallSite, Degraded, FallbackApplied, FallbackDecision, FallbackError};
use crate::strategy::ProcessingStrategy;

use super::types::{ChunkResult, ChunkState, JobId};
use super::PipelineContext;

/// Shared receiver for multiple workers pulling from one unbounded channel.
pub struct SharedReceiver<T> {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> SharedReceiver<T> {
    pub fn new_unbounded(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// Job-level parameters every chunk is processed with.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub job_id: JobId,
    pub tone: Tone,
    pub voice: Voice,
    pub strategy: ProcessingStrategy,
}

/// Spawn chunk workers.
///
/// Workers stop when the chunk channel is drained, the job is cancelled,
/// or the job task stops listening for results.
pub(crate) fn spawn_chunk_workers(
    count: usize,
    rx: SharedReceiver<Chunk>,
    ctx: Arc<PipelineContext>,
    params: ChunkParams,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<ChunkResult>,
) {
    for i in 0..count {
        let rx = rx.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let results = results.clone();

        tokio::spawn(async move {
            tracing::debug!(job_id = %params.job_id, worker = i, "Chunk worker started");

            while !cancel.is_cancelled() {
                let Some(chunk) = rx.recv().await else {
                    break;
                };
                if cancel.is_cancelled() {
                    break;
                }

                let result = process_chunk(&ctx, params, &chunk, &cancel).await;
                if results.send(result).is_err() {
                    break;
                }
            }

            tracing::debug!(job_id = %params.job_id, worker = i, "Chunk worker stopped");
        });
    }
}

/// Split `body` into (leading whitespace, content, trailing whitespace).
fn split_padding(body: &str) -> (&str, &str, &str) {
    let content = body.trim();
    let lead = &body[..body.len() - body.trim_start().len()];
    let trail = &body[lead.len() + content.len()..];
    (lead, content, trail)
}

/// Run one chunk through cache, rewriter and synthesizer.
///
/// Never fails: problems become warnings, degraded output or a `Failed`
/// state on the returned result.
pub(crate) async fn process_chunk(
    ctx: &PipelineContext,
    params: ChunkParams,
    chunk: &Chunk,
    cancel: &CancellationToken,
) -> ChunkResult {
    let index = chunk.index;
    let mut result = ChunkResult::new(index);
    if chunk.degraded_cut {
        result.warnings.push(Warning::ChunkingDegraded { chunk_index: index });
    }

    let (lead, content, trail) = split_padding(chunk.body());
    if content.is_empty() {
        result.rewritten_text = chunk.body().to_string();
        result.state = ChunkState::Done;
        return result;
    }

    let fingerprint = Fingerprint::new(content, params.tone, params.voice, params.strategy);
    if let Some(cache) = &ctx.cache {
        if let Some(entry) = cache.get(&fingerprint).await {
            tracing::debug!(job_id = %params.job_id, chunk_index = index, fingerprint = %fingerprint, "Cache hit");
            result.rewritten_text = format!("{}{}{}", lead, entry.rewritten_text, trail);
            result.audio = entry.audio;
            result.state = ChunkState::Done;
            result.from_cache = true;
            return result;
        }
    }

    // Rewrite
    result.state = ChunkState::Rewriting;
    let rewriter = ctx.rewriter.as_ref();
    let context = chunk.overlap();
    let tone = params.tone;
    let report = ctx
        .fallback
        .call(
            CallSite::new("rewrite"),
            cancel,
            move |_| {
                if context.is_empty() {
                    rewriter.rewrite(content, tone)
                } else {
                    rewriter.rewrite_in_context(context, content, tone)
                }
            },
            || {
                Some(Degraded {
                    value: content.to_string(),
                    applied: FallbackApplied::ReturnedOriginal,
                })
            },
        )
        .await;
    result.decisions.extend(report.decisions);

    let rewritten = match report.result {
        Ok(resolved) => {
            if resolved.is_degraded() {
                result.warnings.push(Warning::RewriteDegraded {
                    chunk_index: index,
                    applied: resolved.applied,
                });
            }
            resolved.value
        }
        Err(FallbackError::Cancelled) => return cancelled(result, chunk),
        Err(e) => {
            result.warnings.push(Warning::FallbackExhausted {
                chunk_index: index,
                reason: e.to_string(),
            });
            content.to_string()
        }
    };
    result.rewritten_text = format!("{}{}{}", lead, rewritten, trail);

    // Synthesize
    result.state = ChunkState::Synthesizing;
    let (input, truncated) = synthesis_input(&rewritten, ctx.synthesizer.max_input_chars());
    if truncated {
        tracing::warn!(job_id = %params.job_id, chunk_index = index, "Synthesis input truncated");
        result
            .decisions
            .push(FallbackDecision::note("synthesize", FallbackApplied::TruncatedInput));
        result.warnings.push(Warning::SynthesisDegraded {
            chunk_index: index,
            applied: FallbackApplied::TruncatedInput,
        });
    }

    let mut site = CallSite::new("synthesize");
    if params.voice != Voice::default() {
        site = site.with_alternate(FallbackApplied::SwitchedToDefaultVoice);
    }
    let synthesizer = ctx.synthesizer.as_ref();
    let text = input.as_str();
    let voice = params.voice;
    let placeholder = ctx.placeholder.clone();
    let report = ctx
        .fallback
        .call(
            site,
            cancel,
            move |attempt| {
                let voice = if attempt.alternate {
                    Voice::default()
                } else {
                    voice
                };
                synthesizer.synthesize(text, voice, voice.locale())
            },
            move || {
                placeholder.map(|clip| Degraded {
                    value: clip,
                    applied: FallbackApplied::ReturnedPlaceholder,
                })
            },
        )
        .await;
    result.decisions.extend(report.decisions);

    match report.result {
        Ok(resolved) => {
            if resolved.is_degraded() {
                result.warnings.push(Warning::SynthesisDegraded {
                    chunk_index: index,
                    applied: resolved.applied,
                });
            }
            result.audio = resolved.value;
            result.state = ChunkState::Done;
        }
        Err(FallbackError::Cancelled) => return cancelled(result, chunk),
        Err(e) => {
            tracing::error!(job_id = %params.job_id, chunk_index = index, error = %e, "Chunk failed");
            result.warnings.push(Warning::FallbackExhausted {
                chunk_index: index,
                reason: e.to_string(),
            });
            result.error = Some(e.to_string());
            result.state = ChunkState::Failed;
        }
    }

    if result.state == ChunkState::Done && !result.is_degraded() {
        if let Some(cache) = &ctx.cache {
            cache
                .put(fingerprint, CacheEntry::new(rewritten, result.audio.clone()))
                .await;
        }
    }

    result
}

fn cancelled(mut result: ChunkResult, chunk: &Chunk) -> ChunkResult {
    result.rewritten_text = chunk.body().to_string();
    result.state = ChunkState::Failed;
    result.error = Some("cancelled".to_string());
    result
}

/// Stand-in for a chunk whose worker vanished without reporting.
pub(crate) fn lost_chunk(chunk: &Chunk) -> ChunkResult {
    let mut result = ChunkResult::new(chunk.index);
    result.rewritten_text = chunk.body().to_string();
    result.state = ChunkState::Failed;
    result.error = Some("worker stopped before finishing".to_string());
    result.warnings.push(Warning::FallbackExhausted {
        chunk_index: chunk.index,
        reason: "worker stopped before finishing".to_string(),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_padding() {
        assert_eq!(split_padding("  Hello world. \n"), ("  ", "Hello world.", " \n"));
        assert_eq!(split_padding("plain"), ("", "plain", ""));
        assert_eq!(split_padding("   "), ("   ", "", ""));
    }

    #[tokio::test]
    async fn test_shared_receiver_distributes_items() {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = SharedReceiver::new_unbounded(rx);
        for i in 0..4 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let other = rx.clone();
        let mut seen = vec![
            rx.recv().await.unwrap(),
            other.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            other.recv().await.unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(rx.recv().await.is_none());
    }
}
