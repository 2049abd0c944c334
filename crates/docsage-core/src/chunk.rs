//! Overlapping, boundary-aware text chunker.
//!
//! Splits a document's normalized text into [`Chunk`]s no longer than
//! `max_tokens × 4` characters. Consecutive chunks share a leading overlap
//! so that a passage cut at a boundary still carries its context.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio and
//!    derive `overlap = floor(max_chars × overlap_fraction)`.
//! 2. Starting at the end of the previous core span, open a window of
//!    `max_chars − overlap` characters.
//! 3. End the core span at the best boundary inside the window: the last
//!    paragraph break in its second half, else the last sentence end in its
//!    second half, else the last whitespace, else the window end.
//! 4. Prefix the core span with up to `overlap` trailing characters of the
//!    previous chunk.
//!
//! Chunk ids and hashes depend only on the document id and the text, so the
//! same input always yields the same chunks.
//!
//! # Example
//!
//! ```rust
//! use docsage_core::chunk::{chunk_text, ChunkSettings};
//!
//! let settings = ChunkSettings::new(1024, 0.5);
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", &settings);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{chunk_id_for, sha256_hex, Chunk};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Largest accepted overlap fraction.
pub const MAX_OVERLAP_FRACTION: f64 = 0.9;

/// Size and overlap settings for [`chunk_text`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkSettings {
    pub max_tokens: usize,
    pub overlap_fraction: f64,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            overlap_fraction: 0.5,
        }
    }
}

impl ChunkSettings {
    pub fn new(max_tokens: usize, overlap_fraction: f64) -> Self {
        Self {
            max_tokens,
            overlap_fraction,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::InvalidInput(
                "chunking.max_tokens must be > 0".to_string(),
            ));
        }
        if !(0.0..=MAX_OVERLAP_FRACTION).contains(&self.overlap_fraction) {
            return Err(Error::InvalidInput(format!(
                "chunking.overlap_fraction must be within [0, {MAX_OVERLAP_FRACTION}], got {}",
                self.overlap_fraction
            )));
        }
        Ok(())
    }

    /// Maximum chunk length in characters.
    pub fn max_chars(&self) -> usize {
        self.max_tokens.max(1) * CHARS_PER_TOKEN
    }

    /// Overlap length in characters.
    pub fn overlap_chars(&self) -> usize {
        let fraction = self.overlap_fraction.clamp(0.0, MAX_OVERLAP_FRACTION);
        (self.max_chars() as f64 * fraction).floor() as usize
    }

    /// Stable string identifying these settings, used in the pipeline key.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}", self.max_tokens, self.overlap_fraction)
    }
}

/// Split `text` into overlapping chunks.
///
/// # Guarantees
///
/// - Empty text yields no chunks.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - No chunk exceeds [`ChunkSettings::max_chars`] characters.
/// - Concatenating [`Chunk::fresh_text`] over all chunks reproduces `text`.
pub fn chunk_text(document_id: &str, text: &str, settings: &ChunkSettings) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let max_chars = settings.max_chars();
    let overlap = settings.overlap_chars();
    let core_max = (max_chars - overlap).max(1);

    // Byte offset of every char, plus the end of the text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = bounds.len() - 1;

    let mut chunks = Vec::new();
    let mut core_start = 0usize;
    let mut prev_start = 0usize;

    while core_start < total {
        let window_end = (core_start + core_max).min(total);
        let core_end = if window_end == total {
            total
        } else {
            let cut = find_cut(text, &bounds, core_start, window_end);
            bounds.partition_point(|&b| b < cut)
        };

        let chunk_start = if chunks.is_empty() {
            core_start
        } else {
            core_start.saturating_sub(overlap).max(prev_start)
        };

        let offset = bounds[chunk_start];
        let core_offset = bounds[core_start];
        let body = &text[offset..bounds[core_end]];
        chunks.push(Chunk {
            id: chunk_id_for(document_id, core_offset),
            document_id: document_id.to_string(),
            chunk_index: chunks.len() as i64,
            offset,
            overlap: core_offset - offset,
            text: body.to_string(),
            hash: sha256_hex(body.as_bytes()),
        });

        prev_start = chunk_start;
        core_start = core_end;
    }

    chunks
}

/// Pick the byte offset at which the core span `[start, end)` (char indices)
/// should end. Always returns a char boundary strictly after `start`.
fn find_cut(text: &str, bounds: &[usize], start: usize, end: usize) -> usize {
    let window_start = bounds[start];
    let window_end = bounds[end];
    let half = bounds[start + (end - start) / 2];
    let window = &text[window_start..window_end];

    if let Some(pos) = window.rfind("\n\n") {
        let cut = window_start + pos + 2;
        if window_start + pos >= half {
            return cut;
        }
    }

    if let Some(cut) = last_sentence_end(window) {
        let cut = window_start + cut;
        if cut > half {
            return cut;
        }
    }

    if let Some((pos, c)) = window.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        return window_start + pos + c.len_utf8();
    }

    window_end
}

/// Relative byte offset just past the last sentence end in `window`.
fn last_sentence_end(window: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = window.char_indices().collect();
    for j in (0..chars.len()).rev() {
        let (i, c) = chars[j];
        if c == '\n' {
            return Some(i + 1);
        }
        if matches!(c, '.' | '!' | '?' | '…') {
            if let Some(&(ni, nc)) = chars.get(j + 1) {
                if nc.is_whitespace() {
                    return Some(ni + nc.len_utf8());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuild(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.fresh_text()).collect()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", &ChunkSettings::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].overlap, 0);
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("doc1", "", &ChunkSettings::default()).is_empty());
    }

    #[test]
    fn test_reconstruction_and_bound() {
        let text = (0..200)
            .map(|i| format!("Sentence number {i} talks about retention. "))
            .collect::<String>();
        for (tokens, fraction) in [(10, 0.0), (10, 0.5), (16, 0.25), (3, 0.9)] {
            let settings = ChunkSettings::new(tokens, fraction);
            let chunks = chunk_text("doc1", &text, &settings);
            assert!(chunks.len() > 1);
            assert_eq!(rebuild(&chunks), text, "settings {settings:?}");
            for c in &chunks {
                assert!(c.text.chars().count() <= settings.max_chars());
                assert_eq!(&text[c.offset..c.offset + c.text.len()], c.text);
            }
        }
    }

    #[test]
    fn test_overlap_is_previous_tail() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let settings = ChunkSettings::new(5, 0.25);
        let chunks = chunk_text("doc1", text, &settings);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let shared = &pair[1].text[..pair[1].overlap];
            assert!(pair[0].text.ends_with(shared));
            assert!(shared.chars().count() <= settings.overlap_chars());
        }
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = "aaaa aaaa aaaa aaaa aaaa.\n\nbbbb bbbb bbbb bbbb bbbb";
        let chunks = chunk_text("doc1", text, &ChunkSettings::new(10, 0.0));
        assert_eq!(chunks[0].text, "aaaa aaaa aaaa aaaa aaaa.\n\n");
        assert_eq!(chunks[1].text, "bbbb bbbb bbbb bbbb bbbb");
    }

    #[test]
    fn test_prefers_sentence_end_over_whitespace() {
        let text = "First sentence here. Second one runs on and on without end";
        let chunks = chunk_text("doc1", text, &ChunkSettings::new(8, 0.0));
        assert_eq!(chunks[0].text, "First sentence here. ");
    }

    #[test]
    fn test_hard_split_without_whitespace() {
        let text = "x".repeat(100);
        let chunks = chunk_text("doc1", &text, &ChunkSettings::new(5, 0.0));
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.text.len() == 20));
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Привет мир 日本語 │\n└──────────────────┘".repeat(4);
        let settings = ChunkSettings::new(3, 0.5);
        let chunks = chunk_text("doc1", &text, &settings);
        assert!(chunks.len() > 1);
        assert_eq!(rebuild(&chunks), text);
        for c in &chunks {
            assert!(c.text.chars().count() <= settings.max_chars());
        }
    }

    #[test]
    fn test_chunk_indices_and_ids() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, &ChunkSettings::new(10, 0.5));
        let mut ids = std::collections::HashSet::new();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "Index mismatch at position {}", i);
            assert!(ids.insert(c.id.clone()), "duplicate id at {}", i);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta.\n\nGamma delta epsilon.\n\nZeta eta theta iota kappa.";
        let settings = ChunkSettings::new(4, 0.5);
        let c1 = chunk_text("doc1", text, &settings);
        let c2 = chunk_text("doc1", text, &settings);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_settings_validation() {
        assert!(ChunkSettings::default().validate().is_ok());
        assert!(ChunkSettings::new(0, 0.5).validate().is_err());
        assert!(ChunkSettings::new(100, 0.95).validate().is_err());
        assert!(ChunkSettings::new(100, -0.1).validate().is_err());
        assert_eq!(ChunkSettings::new(1024, 0.5).overlap_chars(), 2048);
        assert_eq!(ChunkSettings::new(1024, 0.5).fingerprint(), "1024|0.5");
    }
}
