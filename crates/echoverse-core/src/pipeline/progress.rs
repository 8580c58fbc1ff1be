//! Per-job event log and subscriptions.
//!
//! Every event a job emits is appended to its log. Subscribers replay the
//! log from the start and then follow new events through a watch channel
//! carrying the log length, so a late subscriber sees the same sequence as
//! an early one. Streams end after the terminal state event.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{watch, Mutex};

use crate::error::PipelineError;

use super::types::{CancelReason, JobId, JobState, ProgressEvent};

struct TrackerInner {
    job_id: JobId,
    log: Mutex<Log>,
    /// Number of events in the log.
    notify_tx: watch::Sender<usize>,
}

struct Log {
    events: Vec<ProgressEvent>,
    state: JobState,
}

/// Event log and state of one job.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

impl JobTracker {
    pub fn new(job_id: JobId) -> Self {
        let (notify_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(TrackerInner {
                job_id,
                log: Mutex::new(Log {
                    events: Vec::new(),
                    state: JobState::Pending,
                }),
                notify_tx,
            }),
        }
    }

    pub async fn state(&self) -> JobState {
        self.inner.log.lock().await.state
    }

    /// Append an event. Events after the terminal state are dropped.
    pub async fn emit(&self, event: ProgressEvent) {
        let mut log = self.inner.log.lock().await;
        if log.state.is_terminal() {
            tracing::debug!(job_id = %self.inner.job_id, "Dropping event after terminal state");
            return;
        }
        if let ProgressEvent::StateChanged { state, .. } = &event {
            log.state = *state;
        }
        log.events.push(event);
        self.inner.notify_tx.send_replace(log.events.len());
    }

    /// Move the job to `next`, emitting a state event.
    pub async fn transition(&self, next: JobState) -> Result<(), PipelineError> {
        self.transition_with(next, None, None).await
    }

    pub async fn transition_with(
        &self,
        next: JobState,
        reason: Option<CancelReason>,
        error: Option<PipelineError>,
    ) -> Result<(), PipelineError> {
        let mut log = self.inner.log.lock().await;
        let current = log.state;
        if !current.can_transition_to(next) {
            tracing::error!(job_id = %self.inner.job_id, from = %current, to = %next, "Invalid state transition");
            return Err(PipelineError::internal(format!(
                "invalid transition {} -> {}",
                current, next
            )));
        }

        tracing::debug!(job_id = %self.inner.job_id, from = %current, to = %next, "Job state changed");
        log.state = next;
        log.events.push(ProgressEvent::StateChanged {
            state: next,
            reason,
            error,
        });
        self.inner.notify_tx.send_replace(log.events.len());
        Ok(())
    }

    /// Snapshot of all events so far.
    pub async fn events(&self) -> Vec<ProgressEvent> {
        self.inner.log.lock().await.events.clone()
    }

    /// Replay the log, then follow it until the terminal event.
    pub fn subscribe(&self) -> BoxStream<'static, ProgressEvent> {
        let cursor = Cursor {
            tracker: self.clone(),
            rx: self.inner.notify_tx.subscribe(),
            next: 0,
            finished: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            let event = cursor.next_event().await?;
            Some((event, cursor))
        })
        .boxed()
    }
}

struct Cursor {
    tracker: JobTracker,
    rx: watch::Receiver<usize>,
    next: usize,
    finished: bool,
}

impl Cursor {
    async fn next_event(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        loop {
            // Mark the current length seen before reading the log, so a push
            // racing with the read still wakes `changed()`.
            self.rx.borrow_and_update();
            {
                let log = self.tracker.inner.log.lock().await;
                if let Some(event) = log.events.get(self.next) {
                    self.next += 1;
                    self.finished = event.is_terminal();
                    return Some(event.clone());
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}
