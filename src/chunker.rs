//! Text chunking.
//!
//! Splits text into bounded-size chunks by trying progressively finer
//! delimiters (an optional forced delimiter, then paragraph, line, space,
//! and finally individual characters), then stitches a sentence-aware
//! overlap region onto each chunk from its neighbours. The overlap is
//! intentionally approximate; only the zero-overlap split is exact.

const BASE_DELIMITERS: [&str; 3] = ["\n\n", "\n", " "];

/// Splits `text` into chunks of at most `chunk_size` characters (before
/// overlap stitching). `overlap_percent` of the chunk size is split evenly
/// between a tail borrowed from the previous chunk and a head borrowed from
/// the next one.
pub fn split(
    text: &str,
    chunk_size: usize,
    overlap_percent: u32,
    forced_delimiter: Option<&str>,
) -> Vec<String> {
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let overlap = ((chunk_size as f64) * (overlap_percent as f64) / 100.0).round() as usize;
    let target = if overlap > 0 {
        chunk_size.saturating_sub(overlap).max(1)
    } else {
        chunk_size
    };

    let mut delimiters: Vec<&str> = Vec::with_capacity(4);
    if let Some(forced) = forced_delimiter {
        if !forced.is_empty() {
            delimiters.push(forced);
        }
    }
    delimiters.extend(BASE_DELIMITERS);

    let cores = split_recursive(text, &delimiters, target);
    if overlap == 0 {
        return cores;
    }
    stitch_overlap(&cores, overlap)
}

fn split_recursive(text: &str, delimiters: &[&str], limit: usize) -> Vec<String> {
    if char_len(text) <= limit {
        return vec![text.to_string()];
    }
    let Some((delimiter, rest)) = delimiters.split_first() else {
        return char_split(text, limit);
    };

    let mut segments: Vec<String> = Vec::new();
    for segment in text.split_inclusive(*delimiter) {
        if char_len(segment) > limit {
            segments.extend(split_recursive(segment, rest, limit));
        } else {
            segments.push(segment.to_string());
        }
    }
    merge_segments(segments, limit)
}

/// Greedily packs consecutive segments into chunks of at most `limit`
/// characters. Segments keep their trailing delimiters, so concatenating
/// the output reproduces the input exactly.
fn merge_segments(segments: Vec<String>, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for segment in segments {
        let len = char_len(&segment);
        if current_len + len > limit && !current.is_empty() {
            out.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(&segment);
        current_len += len;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Terminal character-level split for segments with no usable delimiter.
fn char_split(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == limit {
            out.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn stitch_overlap(cores: &[String], overlap: usize) -> Vec<String> {
    let half = overlap / 2;
    let mut out = Vec::with_capacity(cores.len());

    for (i, core) in cores.iter().enumerate() {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        let tail_owned;
        let head_owned;

        if i > 0 {
            tail_owned = trim_to_sentence_start(char_tail(&cores[i - 1], half));
            if !tail_owned.is_empty() {
                parts.push(&tail_owned);
            }
        }
        let trimmed_core = core.trim();
        if !trimmed_core.is_empty() {
            parts.push(trimmed_core);
        }
        if i + 1 < cores.len() {
            head_owned = trim_to_sentence_end(char_head(&cores[i + 1], half));
            if !head_owned.is_empty() {
                parts.push(&head_owned);
            }
        }
        out.push(parts.join(" "));
    }
    out
}

/// Drops the leading partial sentence of an overlap tail.
fn trim_to_sentence_start(s: &str) -> String {
    let trimmed = s.trim();
    let bytes = trimmed.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?' | b'\n') {
            return trimmed[i + 1..].trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Cuts an overlap head back to the last complete sentence end.
fn trim_to_sentence_end(s: &str) -> String {
    let trimmed = s.trim();
    match trimmed.rfind(|c| matches!(c, '.' | '!' | '?' | '\n')) {
        Some(idx) => trimmed[..idx + 1].trim().to_string(),
        None => trimmed.to_string(),
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_tail(s: &str, n: usize) -> &str {
    let count = char_len(s);
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((byte_idx, _)) => &s[byte_idx..],
        None => s,
    }
}

fn char_head(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
