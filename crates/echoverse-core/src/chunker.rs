//! Sentence-aware document splitter.
//!
//! # Algorithm
//!
//! 1. From the current position, find the byte offset `max_chars` characters
//!    ahead (fewer when the chunk carries leading overlap).
//! 2. If the rest of the document fits, it becomes the last chunk.
//! 3. Otherwise cut at the furthest sentence end or paragraph break from
//!    [`StructureHints`](crate::document::StructureHints) within reach.
//! 4. If no boundary is within reach, force a cut. In order of preference:
//!    after the last clause punctuation (`,` `;` `:`), before the last
//!    conjunction such as "and" or "because", after the last whitespace,
//!    or hard at the limit. Forced cuts are marked `degraded_cut` and logged.
//!
//! Chunk bodies partition the document: concatenating them in index order
//! gives back the exact input, see [`reassemble`].

use serde::Serialize;

use crate::document::Document;

/// Words a long sentence can be split in front of.
const CONJUNCTIONS: &[&str] = &[
    "and", "or", "but", "yet", "so", "because", "although", "while", "since", "if", "when",
    "where",
];

fn starts_with_conjunction(text: &str) -> bool {
    let word = text
        .split(|c: char| !c.is_alphabetic())
        .next()
        .unwrap_or_default();
    CONJUNCTIONS.iter().any(|c| word.eq_ignore_ascii_case(c))
}

/// One bounded, ordered segment of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    /// Leading overlap (if any) followed by the chunk body.
    pub text: String,
    /// Byte offset of the body in the source document.
    pub start_offset: usize,
    /// Byte offset one past the end of the body.
    pub end_offset: usize,
    pub has_leading_overlap: bool,
    /// The cut ending this chunk fell inside a sentence.
    pub degraded_cut: bool,
}

impl Chunk {
    /// A single chunk spanning the whole document.
    pub fn whole(doc: &Document) -> Self {
        Self {
            index: 0,
            text: doc.text().to_string(),
            start_offset: 0,
            end_offset: doc.text().len(),
            has_leading_overlap: false,
            degraded_cut: false,
        }
    }

    fn overlap_len(&self) -> usize {
        self.text
            .len()
            .saturating_sub(self.end_offset - self.start_offset)
    }

    /// This chunk's own contribution to the document, without overlap.
    pub fn body(&self) -> &str {
        self.text.get(self.overlap_len()..).unwrap_or(&self.text)
    }

    /// Context carried over from the previous chunk (empty for none).
    pub fn overlap(&self) -> &str {
        self.text.get(..self.overlap_len()).unwrap_or_default()
    }

    /// Body length in characters.
    pub fn char_len(&self) -> usize {
        self.body().chars().count()
    }
}

/// Splitting parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    /// `overlap_chars` is clamped to half of `max_chars` so every chunk
    /// still makes forward progress.
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            overlap_chars: overlap_chars.min(max_chars / 2),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Lazily split `doc`. Calling this again (or cloning the iterator)
    /// restarts the sequence and yields identical chunks.
    pub fn split<'a>(&self, doc: &'a Document) -> Chunks<'a> {
        Chunks {
            text: doc.text(),
            boundaries: doc.hints().boundaries(),
            max_chars: self.max_chars,
            overlap_chars: self.overlap_chars,
            position: 0,
            index: 0,
            previous: None,
        }
    }
}

/// Iterator returned by [`Chunker::split`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    boundaries: Vec<usize>,
    max_chars: usize,
    overlap_chars: usize,
    position: usize,
    index: usize,
    /// Body range of the last chunk produced.
    previous: Option<(usize, usize)>,
}

impl<'a> Chunks<'a> {
    /// Tail of the previous body to prefix onto the next chunk.
    fn overlap(&self) -> &'a str {
        let Some((start, end)) = self.previous else {
            return "";
        };
        if self.overlap_chars == 0 {
            return "";
        }

        let prev = &self.text[start..end];
        let tail_start = prev
            .char_indices()
            .rev()
            .nth(self.overlap_chars - 1)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut tail = &prev[tail_start..];

        // Start on a word rather than in the middle of one.
        let mid_word = tail_start > 0
            && prev[..tail_start]
                .chars()
                .next_back()
                .is_some_and(|c| !c.is_whitespace());
        if mid_word {
            if let Some(ws) = tail.find(char::is_whitespace) {
                tail = &tail[ws..];
            }
        }

        let tail = tail.trim_start();
        if tail.trim().is_empty() {
            ""
        } else {
            tail
        }
    }

    /// End offset of the body starting at `self.position`.
    fn cut(&self, budget: usize) -> (usize, bool) {
        let rest = &self.text[self.position..];
        let Some((limit, _)) = rest.char_indices().nth(budget) else {
            return (self.text.len(), false);
        };
        let limit = self.position + limit;

        let reachable = self.boundaries.partition_point(|&b| b <= limit);
        if reachable > 0 && self.boundaries[reachable - 1] > self.position {
            return (self.boundaries[reachable - 1], false);
        }

        (self.forced_cut(limit), true)
    }

    /// Best place to break a sentence that does not fit before `limit`.
    fn forced_cut(&self, limit: usize) -> usize {
        let window = &self.text[self.position..limit];
        // Offsets just past each whitespace, the only places a word starts.
        let breaks: Vec<usize> = window
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(i, c)| self.position + i + c.len_utf8())
            .collect();

        let after_clause = breaks.iter().rev().find(|&&b| {
            self.text[self.position..b]
                .trim_end()
                .ends_with([',', ';', ':'])
        });
        let before_conjunction = breaks.iter().rev().find(|&&b| {
            let head = self.text[self.position..b].trim();
            !head.is_empty() && starts_with_conjunction(&self.text[b..])
        });

        after_clause
            .or(before_conjunction)
            .or(breaks.last())
            .copied()
            .unwrap_or(limit)
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.position >= self.text.len() {
            return None;
        }

        let overlap = self.overlap();
        let overlap_count = overlap.chars().count();
        let budget = self.max_chars.saturating_sub(overlap_count).max(1);
        let (end, degraded_cut) = self.cut(budget);

        let start = self.position;
        let body = &self.text[start..end];
        if degraded_cut {
            tracing::warn!(
                chunk_index = self.index,
                start_offset = start,
                end_offset = end,
                "Forced mid-sentence cut"
            );
        }

        let mut text = String::with_capacity(overlap.len() + body.len());
        text.push_str(overlap);
        text.push_str(body);

        let chunk = Chunk {
            index: self.index,
            text,
            start_offset: start,
            end_offset: end,
            has_leading_overlap: !overlap.is_empty(),
            degraded_cut,
        };

        self.previous = Some((start, end));
        self.position = end;
        self.index += 1;
        Some(chunk)
    }
}

impl std::iter::FusedIterator for Chunks<'_> {}

/// Concatenate chunk bodies in index order, dropping overlap.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);
    ordered.iter().map(|c| c.body()).collect()
}
