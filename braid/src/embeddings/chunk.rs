//! Text chunking strategies

use crate::config::ChunkStrategy;

/// One chunk of input text with its position in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Byte offset into the source text
    pub offset: usize,
    /// Byte length of the chunk
    pub length: usize,
    pub source_id: Option<String>,
    pub text: String,
}

/// Split `text` per the strategy. `size`/`overlap` apply to the `fixed`
/// strategy only and are measured in whitespace-separated tokens.
pub fn chunk_text(
    text: &str,
    strategy: ChunkStrategy,
    size: usize,
    overlap: usize,
    source_id: Option<&str>,
) -> Vec<Chunk> {
    let pieces: Vec<(usize, String)> = match strategy {
        ChunkStrategy::Sentence => split_sentences(text),
        ChunkStrategy::Paragraph => split_paragraphs(text),
        ChunkStrategy::Fixed => split_fixed(text, size.max(1), overlap),
    };

    pieces
        .into_iter()
        .filter(|(_, piece)| !piece.trim().is_empty())
        .enumerate()
        .map(|(index, (offset, piece))| Chunk {
            index,
            offset,
            length: piece.len(),
            source_id: source_id.map(str::to_string),
            text: piece,
        })
        .collect()
}

/// Split on `.`, `!`, or `?` followed by whitespace, keeping the
/// terminator with its sentence.
fn split_sentences(text: &str) -> Vec<(usize, String)> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if matches!(c, '.' | '!' | '?') {
            let next_is_space = bytes
                .get(i + 1)
                .map(|&b| (b as char).is_whitespace())
                .unwrap_or(true);
            if next_is_space {
                let piece = text[start..=i].trim();
                if !piece.is_empty() {
                    let lead = text[start..=i].len() - text[start..=i].trim_start().len();
                    pieces.push((start + lead, piece.to_string()));
                }
                start = i + 1;
            }
        }
        i += 1;
    }
    if start < text.len() {
        let piece = text[start..].trim();
        if !piece.is_empty() {
            let lead = text[start..].len() - text[start..].trim_start().len();
            pieces.push((start + lead, piece.to_string()));
        }
    }
    pieces
}

/// Blank-line split.
fn split_paragraphs(text: &str) -> Vec<(usize, String)> {
    let mut pieces = Vec::new();
    let mut offset = 0;
    for block in text.split("\n\n") {
        let trimmed = block.trim();
        if !trimmed.is_empty() {
            let lead = block.len() - block.trim_start().len();
            pieces.push((offset + lead, trimmed.to_string()));
        }
        offset += block.len() + 2;
    }
    pieces
}

/// Token-count windows with overlap.
fn split_fixed(text: &str, size: usize, overlap: usize) -> Vec<(usize, String)> {
    // (byte offset, token) pairs
    let mut tokens: Vec<(usize, &str)> = Vec::new();
    let mut pos = 0;
    for token in text.split_whitespace() {
        // find() from pos is safe because split_whitespace yields tokens in order
        if let Some(found) = text[pos..].find(token) {
            let at = pos + found;
            tokens.push((at, token));
            pos = at + token.len();
        }
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + size).min(tokens.len());
        let first = tokens[start].0;
        let last = tokens[end - 1];
        let piece = &text[first..last.0 + last.1.len()];
        pieces.push((first, piece.to_string()));
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_split() {
        let chunks = chunk_text(
            "One sentence. Another one! A third? Trailing",
            ChunkStrategy::Sentence,
            0,
            0,
            None,
        );
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["One sentence.", "Another one!", "A third?", "Trailing"]
        );
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].index, 1);
    }

    #[test]
    fn test_decimal_points_not_split() {
        let chunks = chunk_text("Pi is 3.14 roughly. Yes.", ChunkStrategy::Sentence, 0, 0, None);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Pi is 3.14 roughly.");
    }

    #[test]
    fn test_paragraph_split() {
        let chunks = chunk_text(
            "first para\nstill first\n\nsecond para\n\n\nthird",
            ChunkStrategy::Paragraph,
            0,
            0,
            Some("doc-1"),
        );
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "first para\nstill first");
        assert_eq!(chunks[1].text, "second para");
        assert_eq!(chunks[0].source_id.as_deref(), Some("doc-1"));
    }

    #[test]
    fn test_fixed_windows_with_overlap() {
        let text = "a b c d e f g h";
        let chunks = chunk_text(text, ChunkStrategy::Fixed, 4, 1, None);
        assert_eq!(chunks[0].text, "a b c d");
        assert_eq!(chunks[1].text, "d e f g");
        assert_eq!(chunks[2].text, "g h");
    }

    #[test]
    fn test_offsets_point_into_source() {
        let text = "Alpha beta. Gamma delta.";
        let chunks = chunk_text(text, ChunkStrategy::Sentence, 0, 0, None);
        for chunk in &chunks {
            assert_eq!(&text[chunk.offset..chunk.offset + chunk.length], chunk.text);
        }
    }
}
