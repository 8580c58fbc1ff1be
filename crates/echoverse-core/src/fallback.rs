//! Timeout, retry and degrade policy around a single collaborator call.
//!
//! [`FallbackManager::call`] runs an operation under a per-attempt budget,
//! retries timeouts and transient errors with linear backoff, optionally
//! makes one final alternate attempt (the synthesizer's default voice), and
//! finally asks the call site's degrade producer for a fallback value.
//!
//! All attempts and backoff sleeps share one deadline of twice the budget,
//! so a call never takes longer than `2 × budget` in total. The cancellation
//! token is checked before each attempt and interrupts attempts and sleeps.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::collaborators::CollaboratorError;

/// Which fallback (if any) produced or shaped a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackApplied {
    NoneAppliedYet,
    TruncatedInput,
    SwitchedToDefaultVoice,
    ReturnedPlaceholder,
    ReturnedOriginal,
}

impl std::fmt::Display for FallbackApplied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FallbackApplied::NoneAppliedYet => "none",
            FallbackApplied::TruncatedInput => "truncated input",
            FallbackApplied::SwitchedToDefaultVoice => "switched to default voice",
            FallbackApplied::ReturnedPlaceholder => "returned placeholder",
            FallbackApplied::ReturnedOriginal => "returned original text",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Timeout,
    Error,
    Degraded,
}

/// One recorded attempt (or fallback) of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackDecision {
    /// Call site, e.g. `"rewrite"` or `"synthesize"`.
    pub call: &'static str,
    pub attempt: u32,
    pub outcome: Outcome,
    pub applied: FallbackApplied,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FallbackDecision {
    /// A fallback applied outside the attempt loop (e.g. input truncation).
    pub fn note(call: &'static str, applied: FallbackApplied) -> Self {
        Self {
            call,
            attempt: 0,
            outcome: Outcome::Degraded,
            applied,
            elapsed_ms: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    /// Every attempt failed and the degrade producer had nothing to offer.
    #[error("fallback exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("call cancelled")]
    Cancelled,
}

/// Retry policy shared by every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    /// Per-attempt time limit; the whole call is bounded by twice this.
    pub budget: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Backoff before retry `n` is `n × backoff_step`.
    pub backoff_step: Duration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(10),
            retries: 2,
            backoff_step: Duration::from_millis(250),
        }
    }
}

/// Passed to the operation on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// This is the call site's alternate attempt.
    pub alternate: bool,
}

/// Describes a call site to the manager.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    pub name: &'static str,
    /// When set, one extra final attempt is made with `Attempt::alternate`
    /// and a success is tagged with this value.
    pub alternate: Option<FallbackApplied>,
}

impl CallSite {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            alternate: None,
        }
    }

    pub fn with_alternate(mut self, applied: FallbackApplied) -> Self {
        self.alternate = Some(applied);
        self
    }
}

/// Value produced by a degrade function.
#[derive(Debug, Clone, PartialEq)]
pub struct Degraded<T> {
    pub value: T,
    pub applied: FallbackApplied,
}

/// Value a call resolved to, and how.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub applied: FallbackApplied,
}

impl<T> Resolved<T> {
    pub fn is_degraded(&self) -> bool {
        self.applied != FallbackApplied::NoneAppliedYet
    }
}

/// Result of [`FallbackManager::call`] plus everything that was tried.
#[derive(Debug)]
pub struct FallbackReport<T> {
    pub result: Result<Resolved<T>, FallbackError>,
    pub decisions: Vec<FallbackDecision>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackManager {
    policy: FallbackPolicy,
}

impl FallbackManager {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    /// Run `operation` with timeout, retries and degrade.
    ///
    /// Timeouts and transient errors are retried. A permanent error skips
    /// the remaining retries but still allows the alternate attempt.
    pub async fn call<T, F, Fut, D>(
        &self,
        site: CallSite,
        cancel: &CancellationToken,
        mut operation: F,
        degrade: D,
    ) -> FallbackReport<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
        D: FnOnce() -> Option<Degraded<T>>,
    {
        let budget = self.policy.budget;
        let deadline = Instant::now() + budget * 2;
        let primary_attempts = self.policy.retries + 1;
        let total_attempts = primary_attempts + u32::from(site.alternate.is_some());

        let mut decisions = Vec::new();
        let mut last_error = String::from("no attempt made");
        let mut attempts_made = 0;
        let mut number = 1;

        while number <= total_attempts {
            if cancel.is_cancelled() {
                return FallbackReport {
                    result: Err(FallbackError::Cancelled),
                    decisions,
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let alternate = site.alternate.is_some() && number > primary_attempts;
            let applied = match site.alternate {
                Some(applied) if alternate => applied,
                _ => FallbackApplied::NoneAppliedYet,
            };

            let started = Instant::now();
            let attempt = Attempt { number, alternate };
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return FallbackReport {
                        result: Err(FallbackError::Cancelled),
                        decisions,
                    };
                }
                r = tokio::time::timeout(budget.min(remaining), operation(attempt)) => r,
            };
            attempts_made = number;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let retryable = match outcome {
                Ok(Ok(value)) => {
                    decisions.push(FallbackDecision {
                        call: site.name,
                        attempt: number,
                        outcome: Outcome::Success,
                        applied,
                        elapsed_ms,
                        error: None,
                    });
                    return FallbackReport {
                        result: Ok(Resolved { value, applied }),
                        decisions,
                    };
                }
                Ok(Err(e)) => {
                    tracing::warn!(call = site.name, attempt = number, error = %e, "Call failed");
                    last_error = e.to_string();
                    decisions.push(FallbackDecision {
                        call: site.name,
                        attempt: number,
                        outcome: Outcome::Error,
                        applied,
                        elapsed_ms,
                        error: Some(last_error.clone()),
                    });
                    e.is_transient()
                }
                Err(_) => {
                    tracing::warn!(call = site.name, attempt = number, elapsed_ms, "Call timed out");
                    last_error = format!("timed out after {} ms", elapsed_ms);
                    decisions.push(FallbackDecision {
                        call: site.name,
                        attempt: number,
                        outcome: Outcome::Timeout,
                        applied,
                        elapsed_ms,
                        error: Some(last_error.clone()),
                    });
                    true
                }
            };

            if !retryable && number < primary_attempts {
                if site.alternate.is_none() {
                    break;
                }
                // Jump straight to the alternate attempt.
                number = primary_attempts;
            }
            if number >= total_attempts {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let backoff = (self.policy.backoff_step * number).min(remaining);
            if !backoff.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return FallbackReport {
                            result: Err(FallbackError::Cancelled),
                            decisions,
                        };
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            number += 1;
        }

        match degrade() {
            Some(Degraded { value, applied }) => {
                tracing::warn!(call = site.name, applied = %applied, "Degraded after failed attempts");
                decisions.push(FallbackDecision {
                    call: site.name,
                    attempt: attempts_made + 1,
                    outcome: Outcome::Degraded,
                    applied,
                    elapsed_ms: 0,
                    error: None,
                });
                FallbackReport {
                    result: Ok(Resolved { value, applied }),
                    decisions,
                }
            }
            None => {
                tracing::error!(call = site.name, attempts = attempts_made, error = %last_error, "Fallback exhausted");
                FallbackReport {
                    result: Err(FallbackError::Exhausted {
                        attempts: attempts_made,
                        last_error,
                    }),
                    decisions,
                }
            }
        }
    }
}
