//! Rule-based tone adaptation.
//!
//! Runs instantly and never fails, so it serves both as the offline rewriter
//! and as a baseline in tests.

use async_trait::async_trait;

use super::{CollaboratorError, Rewriter, Tone};

/// Above this many characters, text is treated sentence by sentence.
const SENTENCE_MODE_CHARS: usize = 50;

/// Words that already carry a suspenseful tone.
const SUSPENSE_MARKERS: [&str; 2] = ["danger", "threat"];

/// Words that already carry an inspiring tone.
const INSPIRING_MARKERS: [&str; 2] = ["will", "can"];

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicRewriter;

impl HeuristicRewriter {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`Rewriter::rewrite`].
    pub fn apply(&self, text: &str, tone: Tone) -> String {
        if text.trim().is_empty() {
            return text.to_string();
        }
        if text.chars().count() > SENTENCE_MODE_CHARS {
            return rewrite_sentences(text, tone);
        }

        match tone {
            Tone::Suspenseful => {
                if text.ends_with("...") {
                    text.to_string()
                } else {
                    format!("{}...", text.trim_end_matches(['.', '!', '?']))
                }
            }
            Tone::Inspiring => {
                if let Some(stripped) = text.strip_suffix('.') {
                    format!("{}!", stripped)
                } else if text.ends_with('!') {
                    text.to_string()
                } else {
                    format!("{}!", text)
                }
            }
            Tone::Neutral => text.replace("...", ".").replace('!', "."),
        }
    }
}

fn rewrite_sentences(text: &str, tone: Tone) -> String {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|sentence| match tone {
            Tone::Suspenseful => {
                let base = if contains_any(sentence, &SUSPENSE_MARKERS) {
                    sentence.to_string()
                } else {
                    insert_after_first_word(sentence, "mysterious")
                };
                format!("{}...", base)
            }
            Tone::Inspiring => {
                let base = if contains_any(sentence, &INSPIRING_MARKERS) {
                    sentence.to_string()
                } else {
                    insert_after_first_word(sentence, "incredible")
                };
                format!("{}!", base)
            }
            Tone::Neutral => format!("{}.", sentence),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_any(sentence: &str, words: &[&str]) -> bool {
    let lower = sentence.to_lowercase();
    words.iter().any(|w| lower.contains(w))
}

fn insert_after_first_word(sentence: &str, word: &str) -> String {
    match sentence.split_once(' ') {
        Some((first, rest)) => format!("{} {} {}", first, word, rest),
        None => sentence.to_string(),
    }
}

#[async_trait]
impl Rewriter for HeuristicRewriter {
    async fn rewrite(&self, text: &str, tone: Tone) -> Result<String, CollaboratorError> {
        Ok(self.apply(text, tone))
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_suspenseful() {
        let r = HeuristicRewriter::new();
        assert_eq!(r.apply("The door opened.", Tone::Suspenseful), "The door opened...");
        assert_eq!(r.apply("Wait...", Tone::Suspenseful), "Wait...");
    }

    #[test]
    fn test_short_inspiring() {
        let r = HeuristicRewriter::new();
        assert_eq!(r.apply("We made it.", Tone::Inspiring), "We made it!");
        assert_eq!(r.apply("We made it", Tone::Inspiring), "We made it!");
        assert_eq!(r.apply("Go!", Tone::Inspiring), "Go!");
    }

    #[test]
    fn test_short_neutral_cleans_punctuation() {
        let r = HeuristicRewriter::new();
        assert_eq!(r.apply("Stop! Now...", Tone::Neutral), "Stop. Now.");
    }

    #[test]
    fn test_long_text_sentence_mode() {
        let r = HeuristicRewriter::new();
        let text = "The house stood alone on the hill. Nobody had entered it in years.";
        assert_eq!(
            r.apply(text, Tone::Suspenseful),
            "The mysterious house stood alone on the hill... \
             Nobody mysterious had entered it in years..."
        );
        let inspiring = r.apply("You can climb any mountain. The summit is waiting for you there.", Tone::Inspiring);
        assert_eq!(
            inspiring,
            "You can climb any mountain! The incredible summit is waiting for you there!"
        );
    }

    #[test]
    fn test_blank_text_unchanged() {
        assert_eq!(HeuristicRewriter::new().apply("  ", Tone::Inspiring), "  ");
    }

    #[tokio::test]
    async fn test_rewriter_trait() {
        let r = HeuristicRewriter::new();
        let out = r.rewrite("Hello there.", Tone::Inspiring).await.unwrap();
        assert_eq!(out, "Hello there!");
        let out = r
            .rewrite_in_context("Earlier text.", "Hello there.", Tone::Inspiring)
            .await
            .unwrap();
        assert_eq!(out, "Hello there!");
    }
}
