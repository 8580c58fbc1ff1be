//! External collaborators: the rewriter and the synthesizer.
//!
//! The pipeline only knows the two traits below. Implementations:
//! - [`HeuristicRewriter`]: offline, rule-based tone adaptation
//! - [`OpenAiRewriter`] / [`OpenAiSynthesizer`]: OpenAI-compatible HTTP APIs
//! - [`DryRunSynthesizer`]: silent WAV audio, no network

pub mod heuristic;
pub mod openai;
mod placeholder;

pub use heuristic::HeuristicRewriter;
pub use openai::{OpenAiConfig, OpenAiRewriter, OpenAiSynthesizer};
pub use placeholder::{placeholder_clip, silent_wav, DryRunSynthesizer};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Documented per-call input limit of the synthesizer.
pub const SYNTHESIZER_INPUT_LIMIT: usize = 8000;

/// Target tone for rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Neutral,
    Suspenseful,
    Inspiring,
}

impl Tone {
    pub const ALL: [Tone; 3] = [Tone::Neutral, Tone::Suspenseful, Tone::Inspiring];

    pub fn as_str(self) -> &'static str {
        match self {
            Tone::Neutral => "neutral",
            Tone::Suspenseful => "suspenseful",
            Tone::Inspiring => "inspiring",
        }
    }
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tone::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown tone: {}", s))
    }
}

/// Accent the synthesizer should speak with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Locale {
    Us,
    Uk,
    Au,
    Ca,
    Ie,
    Za,
}

impl Locale {
    /// BCP 47 tag.
    pub fn tag(self) -> &'static str {
        match self {
            Locale::Us => "en-US",
            Locale::Uk => "en-GB",
            Locale::Au => "en-AU",
            Locale::Ca => "en-CA",
            Locale::Ie => "en-IE",
            Locale::Za => "en-ZA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

/// The six named voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Sarah,
    Emma,
    Lisa,
    James,
    David,
    Michael,
}

impl Voice {
    pub const ALL: [Voice; 6] = [
        Voice::Sarah,
        Voice::Emma,
        Voice::Lisa,
        Voice::James,
        Voice::David,
        Voice::Michael,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Voice::Sarah => "Sarah",
            Voice::Emma => "Emma",
            Voice::Lisa => "Lisa",
            Voice::James => "James",
            Voice::David => "David",
            Voice::Michael => "Michael",
        }
    }

    pub fn locale(self) -> Locale {
        match self {
            Voice::Sarah => Locale::Us,
            Voice::Emma => Locale::Au,
            Voice::Lisa => Locale::Za,
            Voice::James => Locale::Uk,
            Voice::David => Locale::Ca,
            Voice::Michael => Locale::Ie,
        }
    }

    pub fn gender(self) -> Gender {
        match self {
            Voice::Sarah | Voice::Emma | Voice::Lisa => Gender::Female,
            Voice::James | Voice::David | Voice::Michael => Gender::Male,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Voice::Sarah => "American professional",
            Voice::Emma => "Australian friendly",
            Voice::Lisa => "South African expressive",
            Voice::James => "British authoritative",
            Voice::David => "Canadian neutral",
            Voice::Michael => "Irish melodic",
        }
    }
}

impl std::fmt::Display for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Voice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Voice::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown voice: {}", s))
    }
}

/// Failure of a single collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Network or server trouble that may clear up on retry.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited,

    /// The collaborator refused this input; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }
}

/// Maps (text, tone) to text.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, text: &str, tone: Tone) -> Result<String, CollaboratorError>;

    /// Rewrite `text` with the preceding `context` available for reference.
    /// Only `text` is rewritten; the default ignores the context.
    async fn rewrite_in_context(
        &self,
        context: &str,
        text: &str,
        tone: Tone,
    ) -> Result<String, CollaboratorError> {
        let _ = context;
        self.rewrite(text, tone).await
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Maps (text, voice, locale) to audio bytes.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: Voice,
        locale: Locale,
    ) -> Result<Bytes, CollaboratorError>;

    /// Longest input accepted in one call, in characters.
    fn max_input_chars(&self) -> usize {
        SYNTHESIZER_INPUT_LIMIT
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Flatten line breaks and cap `text` at `max_chars` characters, cutting at
/// the last word boundary. Returns the prepared text and whether it was cut.
pub fn synthesis_input(text: &str, max_chars: usize) -> (String, bool) {
    let flat: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let Some((limit, _)) = flat.char_indices().nth(max_chars) else {
        return (flat, false);
    };

    let head = &flat[..limit];
    let cut = match head.rfind(' ') {
        Some(i) if i > 0 => &head[..i],
        _ => head,
    };
    (cut.to_string(), true)
}
