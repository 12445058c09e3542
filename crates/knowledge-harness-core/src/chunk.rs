//! Overlapping, sentence-aware text chunker.
//!
//! Splits document content into [`TextChunk`]s of roughly `chunk_size`
//! characters, with `overlap_size` characters shared between neighbours.
//! All sizes and offsets are measured in characters, never bytes, so
//! multi-byte UTF-8 content is split safely.
//!
//! # Algorithm
//!
//! 1. Start at character 0.
//! 2. Propose an end at `start + chunk_size` (clamped to the content length).
//! 3. If `preserve_sentences` is set and the end is inside the content,
//!    move it to the nearest sentence terminator within a tolerance window
//!    of `chunk_size / 10` characters; failing that, to the nearest
//!    whitespace before the proposal.
//! 4. Emit `[start, end)` as a chunk.
//! 5. Back up by `overlap_size` characters to get the next start. With
//!    `preserve_sentences` the start is moved forward to the next word
//!    start, never past `end`.
//! 6. Repeat until the end of the content is emitted.
//!
//! Every next start is `<= end` of the previous chunk, so the union of the
//! chunk spans always covers the whole content. The function is pure: the
//! same content and options always produce the same chunk list.
//!
//! # Example
//!
//! ```rust
//! use knowledge_harness_core::chunk::{chunk_text, ChunkOptions};
//!
//! let options = ChunkOptions::default();
//! let chunks = chunk_text("Hello world. Second sentence.", &options).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].position, 0);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Map;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::models::{ChunkMetadata, ParentSpan, TextChunk};

pub const MIN_CHUNK_SIZE: usize = 100;
pub const MAX_CHUNK_SIZE: usize = 2000;
pub const MAX_PARENT_SIZE: usize = 8000;

/// Chunking parameters. Validated by [`ChunkOptions::validate`] before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOptions {
    /// Target characters per chunk, within `[100, 2000]`.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks; `< chunk_size`.
    #[serde(default)]
    pub overlap_size: usize,
    /// Snap boundaries to sentence ends instead of cutting mid-sentence.
    #[serde(default)]
    pub preserve_sentences: bool,
    /// Size of the parent window recorded for small-to-big expansion.
    #[serde(default)]
    pub parent_size: Option<usize>,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap_size: 50,
            preserve_sentences: true,
            parent_size: None,
        }
    }
}

impl ChunkOptions {
    pub fn validate(&self) -> EngineResult<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(EngineError::Configuration(format!(
                "chunk_size must be within [{}, {}], got {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.overlap_size >= self.chunk_size {
            return Err(EngineError::Configuration(format!(
                "overlap_size ({}) must be smaller than chunk_size ({})",
                self.overlap_size, self.chunk_size
            )));
        }
        // A snapped chunk can run `tolerance` past chunk_size; its parent
        // window must still contain it.
        if let Some(parent) = self.parent_size {
            let longest_chunk = self.chunk_size + self.tolerance();
            if parent <= longest_chunk || parent > MAX_PARENT_SIZE {
                return Err(EngineError::Configuration(format!(
                    "parent_size must be within ({}, {}], got {}",
                    longest_chunk, MAX_PARENT_SIZE, parent
                )));
            }
        }
        Ok(())
    }

    fn tolerance(&self) -> usize {
        self.chunk_size / 10
    }
}

/// Split content into ordered, overlapping chunks.
///
/// # Guarantees
///
/// - Empty content yields zero chunks; callers decide whether that is an error.
/// - Content no longer than `chunk_size` yields exactly one chunk.
/// - Positions are contiguous: `0, 1, 2, …, N-1`.
/// - Chunk spans cover every character of the content.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`] for invalid options.
pub fn chunk_text(content: &str, options: &ChunkOptions) -> EngineResult<Vec<TextChunk>> {
    options.validate()?;

    if content.is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = content.chars().collect();
    let offsets: Vec<usize> = content
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(content.len()))
        .collect();
    let total = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let target = (start + options.chunk_size).min(total);
        let end = if target < total && options.preserve_sentences {
            snap_to_sentence_end(&chars, start, target, options.tolerance())
        } else {
            target
        };

        chunks.push(make_chunk(
            &content[offsets[start]..offsets[end]],
            chunks.len() as i64,
            start,
            end,
            options.parent_size.map(|size| parent_span(start, end, size, total)),
        ));

        if end >= total {
            break;
        }

        let mut next = end.saturating_sub(options.overlap_size);
        if options.preserve_sentences {
            next = snap_to_word_start(&chars, next, end);
        }
        start = next.max(start + 1);
    }

    Ok(chunks)
}

/// Extract `[start_char, end_char)` from `text`, clamped to its length.
pub fn slice_chars(text: &str, start_char: usize, end_char: usize) -> String {
    text.chars()
        .skip(start_char)
        .take(end_char.saturating_sub(start_char))
        .collect()
}

/// SHA-256 hex digest of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

/// A sentence ends at `p` when the previous char terminates a sentence and
/// the next one (if any) is whitespace.
fn is_sentence_end(chars: &[char], p: usize) -> bool {
    p > 0 && is_terminator(chars[p - 1]) && (p == chars.len() || chars[p].is_whitespace())
}

fn snap_to_sentence_end(chars: &[char], start: usize, target: usize, tolerance: usize) -> usize {
    let total = chars.len();
    for d in 0..=tolerance {
        if target >= d && target - d > start && is_sentence_end(chars, target - d) {
            return target - d;
        }
        if d > 0 && target + d <= total && is_sentence_end(chars, target + d) {
            return target + d;
        }
    }
    for d in 0..=tolerance {
        if target < d || target - d <= start {
            break;
        }
        let p = target - d;
        if chars[p].is_whitespace() {
            return p;
        }
    }
    target
}

/// Move `from` forward to the next word start, stopping at `limit`.
/// Returns `from` unchanged when no word start exists in range.
fn snap_to_word_start(chars: &[char], from: usize, limit: usize) -> usize {
    let mut p = from;
    while p < limit {
        let at_word_start = (p == 0 || chars[p - 1].is_whitespace()) && !chars[p].is_whitespace();
        if at_word_start {
            return p;
        }
        p += 1;
    }
    from
}

/// Window of `size` characters centred on `[start, end)`, clamped to content.
fn parent_span(start: usize, end: usize, size: usize, total: usize) -> ParentSpan {
    let extra = size.saturating_sub(end - start);
    let mut parent_start = start.saturating_sub(extra / 2);
    let parent_end = (parent_start + size).min(total);
    if parent_end - parent_start < size {
        parent_start = parent_end.saturating_sub(size);
    }
    ParentSpan {
        start_char: parent_start,
        end_char: parent_end,
    }
}

fn make_chunk(
    text: &str,
    position: i64,
    start: usize,
    end: usize,
    parent: Option<ParentSpan>,
) -> TextChunk {
    TextChunk {
        content: text.to_string(),
        position,
        metadata: ChunkMetadata {
            start_char: start,
            end_char: end,
            content_hash: content_hash(text),
            parent,
            extra: Map::new(),
        },
    }
}
