//! Ingested documents and their structure hints.
//!
//! A [`Document`] is immutable once built. Its [`StructureHints`] record the
//! byte offsets where a sentence or paragraph ends, measured *after* the
//! whitespace that follows the terminator. Cutting a document at any hint
//! therefore leaves each piece with its own trailing whitespace and the next
//! piece starting at visible text.

use serde::Serialize;

use crate::error::PipelineError;

/// Characters that end a sentence.
const TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Characters allowed between a terminator and the following whitespace
/// (`He said "stop."` still ends a sentence).
const CLOSERS: [char; 6] = ['"', '\'', ')', ']', '\u{201d}', '\u{2019}'];

/// Punctuation counted towards the complexity score.
const DENSE_PUNCTUATION: [char; 10] = [',', ';', ':', '(', ')', '[', ']', '{', '}', '"'];

/// Boundary offsets found while ingesting a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StructureHints {
    /// Offsets just past a sentence terminator and its trailing whitespace.
    pub sentence_ends: Vec<usize>,
    /// Offsets just past a blank-line paragraph break.
    pub paragraph_breaks: Vec<usize>,
}

impl StructureHints {
    /// Scan `text` for sentence and paragraph boundaries.
    pub fn scan(text: &str) -> Self {
        let mut hints = StructureHints::default();
        let mut chars = text.char_indices().peekable();
        // Whether the last visible run ended a sentence.
        let mut terminal = false;

        while let Some((i, c)) = chars.next() {
            if !c.is_whitespace() {
                if TERMINATORS.contains(&c) {
                    terminal = true;
                } else if !(terminal && CLOSERS.contains(&c)) {
                    terminal = false;
                }
                continue;
            }

            // Consume the whole whitespace run.
            let mut newlines = usize::from(c == '\n');
            let mut end = i + c.len_utf8();
            while let Some(&(j, d)) = chars.peek() {
                if !d.is_whitespace() {
                    break;
                }
                if d == '\n' {
                    newlines += 1;
                }
                end = j + d.len_utf8();
                chars.next();
            }

            if newlines >= 2 {
                hints.paragraph_breaks.push(end);
            }
            if terminal {
                hints.sentence_ends.push(end);
            }
            terminal = false;
        }

        if terminal {
            hints.sentence_ends.push(text.len());
        }

        hints
    }

    /// All safe cut points, sorted and deduplicated.
    pub fn boundaries(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self
            .sentence_ends
            .iter()
            .chain(self.paragraph_breaks.iter())
            .copied()
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}

/// Raw input text plus derived length and structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    text: String,
    length: usize,
    hints: StructureHints,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let length = text.chars().count();
        let hints = StructureHints::scan(&text);
        Self {
            text,
            length,
            hints,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in characters (not bytes).
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn hints(&self) -> &StructureHints {
        &self.hints
    }

    /// Empty or whitespace-only documents produce empty output.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Reject documents that must fail before any processing starts.
    pub fn validate(&self, max_chars: usize) -> Result<(), PipelineError> {
        if self.text.contains('\0') {
            return Err(PipelineError::MalformedDocument {
                reason: "document contains NUL characters".to_string(),
            });
        }
        if self.length > max_chars {
            return Err(PipelineError::InputTooLarge {
                length: self.length,
                limit: max_chars,
            });
        }
        Ok(())
    }

    pub fn analyze(&self) -> TextAnalysis {
        TextAnalysis::of(self)
    }
}

/// Descriptive statistics used for planning and reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextAnalysis {
    pub char_count: usize,
    pub word_count: usize,
    pub sentence_count: usize,
    pub paragraph_count: usize,
    pub avg_sentence_words: f32,
    pub avg_paragraph_chars: f32,
    /// 0.0 (plain) to 1.0 (dense).
    pub complexity: f32,
}

impl TextAnalysis {
    fn of(doc: &Document) -> Self {
        let text = doc.text();
        let words: Vec<&str> = text.split_whitespace().collect();
        let sentences = sentence_word_counts(text);
        let sentence_count = sentences.len();
        let paragraph_count = if doc.is_blank() {
            0
        } else {
            doc.hints().paragraph_breaks.len() + 1
        };

        let avg_sentence_words = words.len() as f32 / sentence_count.max(1) as f32;
        let avg_paragraph_chars = doc.length() as f32 / paragraph_count.max(1) as f32;

        Self {
            char_count: doc.length(),
            word_count: words.len(),
            sentence_count,
            paragraph_count,
            avg_sentence_words,
            avg_paragraph_chars,
            complexity: complexity(doc.length(), text, &words, &sentences),
        }
    }
}

/// Word counts of each sentence, splitting on terminator runs.
fn sentence_word_counts(text: &str) -> Vec<usize> {
    text.split(|c: char| TERMINATORS.contains(&c))
        .map(|s| s.split_whitespace().count())
        .filter(|&n| n > 0)
        .collect()
}

fn complexity(char_count: usize, text: &str, words: &[&str], sentences: &[usize]) -> f32 {
    if words.is_empty() {
        return 0.0;
    }

    let long_words = words.iter().filter(|w| w.chars().count() > 7).count();
    let long_ratio = long_words as f32 / words.len() as f32;

    let punctuation = text
        .chars()
        .filter(|c| DENSE_PUNCTUATION.contains(c))
        .count();
    let density = punctuation as f32 / char_count.max(1) as f32;

    let deviation = if sentences.len() < 2 {
        0.0
    } else {
        let n = sentences.len() as f32;
        let mean = sentences.iter().sum::<usize>() as f32 / n;
        let variance = sentences
            .iter()
            .map(|&len| (len as f32 - mean).powi(2))
            .sum::<f32>()
            / n;
        variance.sqrt()
    };

    let score =
        long_ratio * 0.4 + (density * 10.0).min(1.0) * 0.3 + (deviation / 50.0).min(1.0) * 0.3;
    score.min(1.0)
}
