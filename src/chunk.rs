//! Chunker (spec §4.2).
//!
//! Converts a document's markdown representation into an ordered list of
//! chunks. Table segments (lines that look like a markdown table row) are
//! atomic — never split across a chunk boundary — everything else is
//! packed into `chunk_size`-character windows with `chunk_overlap`
//! characters of overlap between consecutive chunks.

use crate::models::DocumentChunk;

/// A maximal run of contiguous markdown lines that is either "table" or
/// "prose". Table segments become their own chunk regardless of size;
/// prose segments get packed together up to `chunk_size`.
#[derive(Debug, Clone)]
struct Segment {
    text: String,
    is_table: bool,
}

/// A line opens a table segment when it starts with `|` and has another
/// `|` somewhere after position 0 (spec §4.2 step 2).
fn looks_like_table_row(line: &str) -> bool {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('|') {
        return false;
    }
    trimmed[1..].contains('|')
}

fn segment_lines(markdown: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_is_table = false;
    let mut has_current = false;

    for line in markdown.lines() {
        let is_table_line = looks_like_table_row(line);
        if has_current && is_table_line != current_is_table {
            segments.push(Segment {
                text: std::mem::take(&mut current),
                is_table: current_is_table,
            });
            has_current = false;
        }
        if !has_current {
            current_is_table = is_table_line;
            has_current = true;
        } else {
            current.push('\n');
        }
        current.push_str(line);
    }
    if has_current {
        segments.push(Segment {
            text: current,
            is_table: current_is_table,
        });
    }
    segments
}

/// Force-split an oversize prose segment at paragraph boundaries, then
/// hard-split any remaining oversize piece (spec §4.2 edge case).
fn split_oversize(text: &str, chunk_size: usize) -> Vec<String> {
    if text.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut buf = String::new();
    for para in text.split("\n\n") {
        let candidate_len = buf.len() + if buf.is_empty() { 0 } else { 2 } + para.len();
        if !buf.is_empty() && candidate_len > chunk_size {
            pieces.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }

    // Hard-split anything still oversize (a single paragraph bigger than
    // chunk_size has nowhere left to break but mid-text).
    let mut out = Vec::new();
    for piece in pieces {
        if piece.len() <= chunk_size {
            out.push(piece);
            continue;
        }
        let chars: Vec<char> = piece.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + chunk_size).min(chars.len());
            out.push(chars[start..end].iter().collect());
            start = end;
        }
    }
    out
}

/// Pack prose text into overlapping windows of at most `chunk_size`
/// characters, each overlapping the previous by `chunk_overlap` characters.
fn pack_with_overlap(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let stride = chunk_size.saturating_sub(chunk_overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    out
}

/// One chunk of plain text prior to summarization: carries its
/// `chunk_index` and `has_table` flag but not yet a title/summary/embedding
/// (those are added by [`crate::summarizer`]).
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub chunk_index: i64,
    pub text: String,
    pub has_table: bool,
}

/// Split a document's markdown representation into an ordered list of raw
/// chunks. Returns an empty vec for empty input — the caller (the
/// ingestion worker) treats that as the "no extractable content" terminal
/// failure (spec §4.2 edge case, §4.5 step 2).
pub fn chunk_markdown(markdown: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<RawChunk> {
    if markdown.trim().is_empty() {
        return Vec::new();
    }

    let segments = segment_lines(markdown);
    let mut pieces: Vec<(String, bool)> = Vec::new();

    let mut prose_buf = String::new();
    let flush_prose = |buf: &mut String, pieces: &mut Vec<(String, bool)>, chunk_size: usize| {
        if buf.trim().is_empty() {
            buf.clear();
            return;
        }
        for window in pack_with_overlap(buf.trim(), chunk_size, 0) {
            pieces.push((window, false));
        }
        buf.clear();
    };

    for seg in segments {
        if seg.is_table {
            flush_prose(&mut prose_buf, &mut pieces, chunk_size);
            pieces.push((seg.text, true));
        } else {
            let candidate_len = prose_buf.len() + seg.text.len() + 1;
            if !prose_buf.is_empty() && candidate_len > chunk_size {
                flush_prose(&mut prose_buf, &mut pieces, chunk_size);
            }
            if !prose_buf.is_empty() {
                prose_buf.push('\n');
            }
            prose_buf.push_str(&seg.text);
        }
    }
    flush_prose(&mut prose_buf, &mut pieces, chunk_size);

    // Re-expand any still-oversize prose piece (force-split at paragraph
    // boundaries, then hard-split). Table pieces are left untouched
    // regardless of size.
    let mut expanded: Vec<(String, bool)> = Vec::new();
    for (text, is_table) in pieces {
        if is_table || text.len() <= chunk_size {
            expanded.push((text, is_table));
            continue;
        }
        for part in split_oversize(&text, chunk_size) {
            expanded.push((part, false));
        }
    }

    // Apply cross-chunk overlap between consecutive prose chunks only;
    // table chunks are atomic and never gain borrowed context.
    let mut out = Vec::with_capacity(expanded.len());
    let mut prev_tail: Option<String> = None;
    for (idx, (text, is_table)) in expanded.into_iter().enumerate() {
        let final_text = if !is_table {
            match prev_tail.take() {
                Some(tail) => format!("{}{}", tail, text),
                None => text.clone(),
            }
        } else {
            text.clone()
        };

        if !is_table && chunk_overlap > 0 {
            let char_count = text.chars().count();
            let take = chunk_overlap.min(char_count);
            let tail: String = text.chars().skip(char_count - take).collect();
            prev_tail = Some(tail);
        } else {
            prev_tail = None;
        }

        out.push(RawChunk {
            chunk_index: idx as i64,
            text: final_text,
            has_table: is_table,
        });
    }

    out
}

/// Extract a structured-markdown-ish representation of a PDF's text.
/// SPEC_FULL §4.2 names a `DocumentTextExtractor` trait so future formats
/// can plug in; the only extractor in this pipeline is PDF.
pub trait DocumentTextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> anyhow::Result<String>;
}

pub struct PdfTextExtractor;

impl DocumentTextExtractor for PdfTextExtractor {
    fn extract(&self, bytes: &[u8]) -> anyhow::Result<String> {
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| anyhow::anyhow!("PDF extraction failed: {}", e))
    }
}

/// Build a [`DocumentChunk`] row from a raw chunk for persistence; callers
/// fill in `title`/`summary` from the summarizer before inserting.
pub fn to_document_chunk(
    document_id: &str,
    chunk_id: String,
    raw: &RawChunk,
    title: String,
    summary: String,
) -> DocumentChunk {
    DocumentChunk {
        id: chunk_id,
        document_id: document_id.to_string(),
        chunk_index: raw.chunk_index,
        title,
        summary,
        original_text: raw.text.clone(),
        has_table: raw.has_table,
        chunk_metadata: serde_json::json!({}),
    }
}
