use crate::config::Settings;
use crate::error::IngestError;
use std::collections::VecDeque;

pub const PDF_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];
pub const TEXT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];
pub const MARKDOWN_SEPARATORS: &[&str] = &[
    "\n## ", "\n### ", "\n#### ", "\n\n", "\n", ". ", " ", "",
];

/// Target chunk size and overlap, both measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be positive".to_string(),
            ));
        }
        if chunk_overlap > chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk overlap {chunk_overlap} is larger than chunk size {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            chunk_overlap: crate::config::DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl TryFrom<&Settings> for ChunkingConfig {
    type Error = IngestError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        Self::new(settings.chunk_size, settings.chunk_overlap)
    }
}

/// Splits text on the first separator that occurs in it, recursing into pieces
/// that are still too large with the remaining separators, then greedily merges
/// neighbouring pieces back up to the target size with the configured overlap.
///
/// Separators stay attached to the start of the piece that follows them. The
/// empty separator splits into single characters.
#[derive(Debug, Clone, Copy)]
pub struct RecursiveSplitter<'a> {
    config: ChunkingConfig,
    separators: &'a [&'a str],
}

impl<'a> RecursiveSplitter<'a> {
    pub fn new(config: ChunkingConfig, separators: &'a [&'a str]) -> Self {
        Self { config, separators }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, self.separators)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (separator, remaining) = pick_separator(text, separators);
        let mut chunks = Vec::new();
        let mut pending: Vec<(&str, usize)> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            let length = piece.chars().count();
            if length < self.config.chunk_size {
                pending.push((piece, length));
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }

            if remaining.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, remaining));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }

        chunks
    }

    fn merge(&self, pieces: &[(&str, usize)]) -> Vec<String> {
        let ChunkingConfig {
            chunk_size,
            chunk_overlap,
        } = self.config;

        let mut merged = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &(piece, length) in pieces {
            if total + length > chunk_size && !window.is_empty() {
                if let Some(chunk) = join_window(&window) {
                    merged.push(chunk);
                }

                while total > chunk_overlap || (total + length > chunk_size && total > 0) {
                    match window.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }

            window.push_back((piece, length));
            total += length;
        }

        if let Some(chunk) = join_window(&window) {
            merged.push(chunk);
        }

        merged
    }
}

fn pick_separator<'s>(text: &str, separators: &'s [&'s str]) -> (&'s str, &'s [&'s str]) {
    for (position, &separator) in separators.iter().enumerate() {
        if separator.is_empty() {
            return (separator, &[]);
        }
        if text.contains(separator) {
            return (separator, &separators[position + 1..]);
        }
    }

    (separators.last().copied().unwrap_or(""), &[])
}

fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(start, ch)| &text[start..start + ch.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (position, _) in text.match_indices(separator) {
        pieces.push(&text[start..position]);
        start = position;
    }
    pieces.push(&text[start..]);

    pieces.into_iter().filter(|piece| !piece.is_empty()).collect()
}

fn join_window(window: &VecDeque<(&str, usize)>) -> Option<String> {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
