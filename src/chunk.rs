//! Chunker (C6): splits Document content into [`Chunk`]s per document-type policy.
//!
//! - Short/atomic types (event, contact, message) produce exactly one chunk
//!   equal to the whole content.
//! - Long-prose types split on blank-line paragraphs, greedily accumulating
//!   text until the next paragraph would exceed `max_chunk_size`, then close
//!   the chunk and start the next one with the trailing `overlap` characters
//!   of the previous chunk as a leading prefix.
//!
//! Each chunk receives a deterministic UUID, a SHA-256 hash of its text, and
//! `start_offset`/`end_offset` into the original content (offsets on the
//! chunk's own slice, excluding any overlap prefix it was given).

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Chunk, DocumentType};

#[derive(Debug, Error)]
pub enum ChunkingError {
    #[error("chunking failed: {0}")]
    Failed(String),
}

/// Split `content` into chunks according to `doc_type`'s policy.
pub fn chunk_document(
    document_id: &str,
    doc_type: DocumentType,
    content: &str,
    max_chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ChunkingError> {
    if doc_type.is_short_atomic() {
        return Ok(vec![make_chunk(
            document_id,
            "short_atomic",
            0,
            content,
            0,
            content.len(),
        )]);
    }

    Ok(chunk_long_prose(document_id, content, max_chunk_size, overlap))
}

fn chunk_long_prose(
    document_id: &str,
    content: &str,
    max_chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    const KIND: &str = "long_prose";

    if content.is_empty() {
        return vec![make_chunk(document_id, KIND, 0, content, 0, 0)];
    }

    let paragraphs: Vec<&str> = content.split("\n\n").filter(|p| !p.trim().is_empty()).collect();
    if paragraphs.is_empty() {
        return vec![make_chunk(
            document_id,
            KIND,
            0,
            content.trim(),
            0,
            content.trim().len(),
        )];
    }

    let mut chunks = Vec::new();
    let mut current_buf = String::new();
    let mut current_start: usize = 0;
    let mut cursor: usize = 0;
    let mut chunk_index: i64 = 0;

    // Flushes `current_buf` as a chunk, then seeds the next chunk with the
    // trailing `overlap` characters of the one just closed.
    let flush = |chunks: &mut Vec<Chunk>,
                 chunk_index: &mut i64,
                 current_buf: &mut String,
                 current_start: &mut usize| {
        let end = *current_start + current_buf.len();
        chunks.push(make_chunk(document_id, KIND, *chunk_index, current_buf, *current_start, end));
        *chunk_index += 1;

        let prefix: String = tail_chars(current_buf, overlap);
        *current_start = end.saturating_sub(prefix.chars().count());
        *current_buf = prefix;
    };

    for para in &paragraphs {
        let trimmed = para.trim();

        if trimmed.len() > max_chunk_size {
            // A single paragraph larger than max_chunk_size can't be
            // accumulated at all; flush whatever's pending, then hard-split
            // the paragraph itself at word/line boundaries so no chunk this
            // produces exceeds max_chunk_size either.
            if !current_buf.is_empty() {
                flush(&mut chunks, &mut chunk_index, &mut current_buf, &mut current_start);
                current_buf.clear();
            }

            let mut remaining = trimmed;
            let mut last_piece_end = current_start;
            while !remaining.is_empty() {
                let split_at = remaining.len().min(max_chunk_size);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                let end = current_start + piece.len();
                chunks.push(make_chunk(document_id, KIND, chunk_index, piece, current_start, end));
                chunk_index += 1;
                current_start = end;
                last_piece_end = end;
                remaining = &remaining[actual_split..];
            }

            // Seed the next chunk with the tail of the last hard-split
            // piece, same overlap-prefix rule as a normal flush.
            current_buf = tail_chars(&chunks.last().unwrap().text, overlap);
            current_start = last_piece_end.saturating_sub(current_buf.chars().count());
            cursor += trimmed.len();
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chunk_size && !current_buf.is_empty() {
            flush(&mut chunks, &mut chunk_index, &mut current_buf, &mut current_start);
        }

        if !current_buf.is_empty() {
            current_buf.push_str("\n\n");
        }
        current_buf.push_str(trimmed);
        cursor += trimmed.len();
    }

    if !current_buf.is_empty() {
        let end = current_start + current_buf.len();
        chunks.push(make_chunk(document_id, KIND, chunk_index, &current_buf, current_start, end));
    }

    let _ = cursor;

    if chunks.is_empty() {
        chunks.push(make_chunk(
            document_id,
            KIND,
            0,
            content.trim(),
            0,
            content.trim().len(),
        ));
    }

    chunks
}

/// Last `n` characters of `s`, respecting UTF-8 boundaries.
fn tail_chars(s: &str, n: usize) -> String {
    let total = s.chars().count();
    if total <= n {
        s.to_string()
    } else {
        s.chars().skip(total - n).collect()
    }
}

fn make_chunk(document_id: &str, kind: &str, index: i64, text: &str, start: usize, end: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        start_offset: start as i64,
        end_offset: end as i64,
        hash,
        metadata: serde_json::json!({"type": kind, "index": index}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_atomic_types_produce_one_chunk() {
        for doc_type in [DocumentType::Event, DocumentType::Contact, DocumentType::Message] {
            let chunks = chunk_document("d1", doc_type, "Lunch at noon with Sam", 10, 2).unwrap();
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].text, "Lunch at noon with Sam");
            assert_eq!(chunks[0].chunk_index, 0);
        }
    }

    #[test]
    fn empty_content_yields_single_empty_chunk() {
        let chunks = chunk_document("d1", DocumentType::Note, "", 512, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
    }

    #[test]
    fn small_prose_fits_in_one_chunk() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_document("d1", DocumentType::Note, text, 512, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn long_prose_splits_with_overlap_prefix() {
        let text = (0..20)
            .map(|i| format!("This is paragraph number {i} with some extra padding text."))
            .collect::<Vec<_>>()
            .join("\n\n");

        let chunks = chunk_document("d1", DocumentType::Note, &text, 120, 20).unwrap();
        assert!(chunks.len() > 1);

        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "indices must be contiguous");
        }

        for pair in chunks.windows(2) {
            let prev_tail = tail_chars(&pair[0].text, 20);
            assert!(
                pair[1].text.starts_with(&prev_tail) || prev_tail.is_empty(),
                "next chunk should lead with previous chunk's overlap"
            );
        }
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let huge_paragraph = (0..40)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!("Intro paragraph.\n\n{huge_paragraph}\n\nOutro paragraph.");

        let chunks = chunk_document("d1", DocumentType::Note, &text, 50, 10).unwrap();

        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(
                c.text.len() <= 50,
                "chunk exceeded max_chunk_size: {} chars",
                c.text.len()
            );
        }

        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "indices must be contiguous");
        }

        let joined = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(" ");
        for i in 0..40 {
            assert!(joined.contains(&format!("word{i}")), "missing word{i}");
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta.\n\nEta theta iota.";
        let c1 = chunk_document("d1", DocumentType::Note, text, 20, 5).unwrap();
        let c2 = chunk_document("d1", DocumentType::Note, text, 20, 5).unwrap();
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.chunk_index, b.chunk_index);
        }
    }
}
