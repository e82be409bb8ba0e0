//! Structure-aware text segmenter.
//!
//! Splits markdown-ish document text into comparable [`Segment`]s. Boundaries
//! are blank lines, headings, list markers, horizontal rules, and fenced code
//! blocks. A structural construct is never split: a list item keeps its
//! continuation lines and a fenced block keeps its inner blank lines.
//!
//! # Normalization
//!
//! Each segment carries a `normalized` form used for identity and embedding:
//!
//! 1. Structural markup is removed (heading hashes, list markers, task boxes,
//!    quote markers, code fences).
//! 2. Typographic variants are folded (curly quotes, en/em dashes, ellipsis,
//!    non-breaking spaces) and emphasis markers dropped.
//! 3. Whitespace is collapsed, repeated punctuation squeezed, space before
//!    punctuation removed, and trailing sentence punctuation stripped.
//!
//! Segments whose normalized text has fewer than `min_tokens` words are
//! dropped as noise.
//!
//! # Example
//!
//! ```rust
//! use semdup_core::segment::{segment, SegmentKind};
//!
//! let text = "# Install the tool locally\n\nRun the installer twice.\n\n- first step is download\n- ok";
//! let segments = segment(text, 3);
//! assert_eq!(segments.len(), 3);
//! assert_eq!(segments[0].kind, SegmentKind::Heading);
//! assert_eq!(segments[2].normalized, "first step is download");
//! ```

use serde::Serialize;

/// Default minimum word count for a segment to be kept.
pub const DEFAULT_MIN_TOKENS: usize = 3;

/// Structural origin of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Heading,
    Paragraph,
    ListItem,
    CodeBlock,
    Quote,
}

/// A candidate unit produced by [`segment`]. No identity is assigned yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Position among the kept segments, contiguous from 0.
    pub index: usize,
    pub kind: SegmentKind,
    pub raw: String,
    pub normalized: String,
}

struct Block<'a> {
    kind: SegmentKind,
    lines: Vec<&'a str>,
}

#[derive(Clone, Copy)]
struct Fence {
    marker: char,
    len: usize,
}

/// Split `text` into ordered, normalized segments.
///
/// Deterministic for identical input. Empty or whitespace-only input yields
/// an empty vector.
pub fn segment(text: &str, min_tokens: usize) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current: Option<Block> = None;
    let mut fence: Option<Fence> = None;

    for line in text.lines() {
        if let Some(open) = fence {
            if let Some(block) = current.as_mut() {
                block.lines.push(line);
            }
            if closes_fence(line, open) {
                fence = None;
                flush(&mut current, &mut out, min_tokens);
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || is_rule(trimmed) {
            flush(&mut current, &mut out, min_tokens);
            continue;
        }

        if let Some(open) = opening_fence(trimmed) {
            flush(&mut current, &mut out, min_tokens);
            current = Some(Block {
                kind: SegmentKind::CodeBlock,
                lines: vec![line],
            });
            fence = Some(open);
            continue;
        }

        if is_heading(trimmed) {
            flush(&mut current, &mut out, min_tokens);
            current = Some(Block {
                kind: SegmentKind::Heading,
                lines: vec![trimmed],
            });
            flush(&mut current, &mut out, min_tokens);
            continue;
        }

        if list_marker_len(trimmed).is_some() {
            flush(&mut current, &mut out, min_tokens);
            current = Some(Block {
                kind: SegmentKind::ListItem,
                lines: vec![trimmed],
            });
            continue;
        }

        if trimmed.starts_with('>') {
            if current.as_ref().map(|b| b.kind) != Some(SegmentKind::Quote) {
                flush(&mut current, &mut out, min_tokens);
                current = Some(Block {
                    kind: SegmentKind::Quote,
                    lines: Vec::new(),
                });
            }
            if let Some(block) = current.as_mut() {
                block.lines.push(trimmed);
            }
            continue;
        }

        let continues = matches!(
            current.as_ref().map(|b| b.kind),
            Some(SegmentKind::Paragraph | SegmentKind::ListItem)
        );
        if continues {
            if let Some(block) = current.as_mut() {
                block.lines.push(trimmed);
            }
        } else {
            flush(&mut current, &mut out, min_tokens);
            current = Some(Block {
                kind: SegmentKind::Paragraph,
                lines: vec![trimmed],
            });
        }
    }

    // An unterminated fence still forms one code block.
    flush(&mut current, &mut out, min_tokens);
    out
}

fn flush(current: &mut Option<Block>, out: &mut Vec<Segment>, min_tokens: usize) {
    let Some(block) = current.take() else {
        return;
    };
    let normalized = normalize_block(&block);
    if token_count(&normalized) < min_tokens.max(1) {
        return;
    }
    out.push(Segment {
        index: out.len(),
        kind: block.kind,
        raw: block.lines.join("\n"),
        normalized,
    });
}

fn normalize_block(block: &Block) -> String {
    match block.kind {
        SegmentKind::CodeBlock => {
            let mut lines = &block.lines[1..];
            if let Some(last) = lines.last() {
                if opening_fence(last.trim()).is_some() {
                    lines = &lines[..lines.len() - 1];
                }
            }
            collapse_whitespace(&lines.join(" "))
        }
        SegmentKind::Heading => {
            let line = block.lines.first().copied().unwrap_or_default();
            normalize_text(line.trim_start_matches('#').trim_end_matches('#'))
        }
        SegmentKind::ListItem => {
            let mut parts = Vec::with_capacity(block.lines.len());
            if let Some((first, rest)) = block.lines.split_first() {
                parts.push(strip_task_box(strip_list_marker(first)));
                parts.extend(rest.iter().copied());
            }
            normalize_text(&parts.join(" "))
        }
        SegmentKind::Quote => {
            let stripped: Vec<&str> = block
                .lines
                .iter()
                .map(|l| l.trim_start_matches('>').trim())
                .collect();
            normalize_text(&stripped.join(" "))
        }
        SegmentKind::Paragraph => normalize_text(&block.lines.join(" ")),
    }
}

const SQUEEZED_PUNCT: [char; 7] = ['.', ',', ';', ':', '!', '?', '-'];
const TRAILING_PUNCT: [char; 6] = ['.', ',', ';', ':', '!', '?'];

/// Normalize a prose fragment: fold typography, drop emphasis, collapse
/// whitespace and punctuation variance.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .chars()
        .filter_map(|c| match c {
            '\u{2018}' | '\u{2019}' => Some('\''),
            '\u{201C}' | '\u{201D}' => Some('"'),
            '\u{2013}' | '\u{2014}' => Some('-'),
            '\u{2026}' => Some('.'),
            '\u{00A0}' => Some(' '),
            '*' | '`' => None,
            other => Some(other),
        })
        .collect();

    let joined = folded
        .split_whitespace()
        .map(|w| w.trim_matches('_'))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut out = String::with_capacity(joined.len());
    let mut prev: Option<char> = None;
    for c in joined.chars() {
        if SQUEEZED_PUNCT.contains(&c) && prev == Some(c) {
            continue;
        }
        if TRAILING_PUNCT.contains(&c) && out.ends_with(' ') {
            out.pop();
        }
        out.push(c);
        prev = Some(c);
    }

    out.trim_end_matches(|c: char| TRAILING_PUNCT.contains(&c) || c.is_whitespace())
        .to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Code points for bytes 0x80..=0x9F under Windows-1252. The five bytes it
/// leaves undefined map to the same-valued control characters.
const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{81}', '\u{201A}', '\u{192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{2C6}', '\u{2030}', '\u{160}', '\u{2039}', '\u{152}', '\u{8D}', '\u{17D}', '\u{8F}',
    '\u{90}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{2DC}', '\u{2122}', '\u{161}', '\u{203A}', '\u{153}', '\u{9D}', '\u{17E}', '\u{178}',
];

/// Decode file contents as UTF-8, or as Windows-1252 when they are not
/// valid UTF-8. Every byte yields a character; nothing is replaced.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes
            .iter()
            .map(|&b| match b {
                0x80..=0x9F => CP1252_HIGH[usize::from(b - 0x80)],
                _ => char::from(b),
            })
            .collect(),
    }
}

/// Number of words containing at least one alphanumeric character.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

fn is_heading(trimmed: &str) -> bool {
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
}

fn is_rule(trimmed: &str) -> bool {
    let mut chars = trimmed.chars().filter(|c| !c.is_whitespace());
    let Some(first) = chars.next() else {
        return false;
    };
    if !matches!(first, '-' | '*' | '_' | '=') {
        return false;
    }
    let mut count = 1;
    for c in chars {
        if c != first {
            return false;
        }
        count += 1;
    }
    count >= 3
}

fn opening_fence(trimmed: &str) -> Option<Fence> {
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|&c| c == marker).count();
    (len >= 3).then_some(Fence { marker, len })
}

fn closes_fence(line: &str, open: Fence) -> bool {
    let trimmed = line.trim();
    let run = trimmed.chars().take_while(|&c| c == open.marker).count();
    run >= open.len && trimmed.chars().skip(run).all(char::is_whitespace)
}

/// Byte length of a leading list marker including its trailing space.
fn list_marker_len(trimmed: &str) -> Option<usize> {
    let bytes = trimmed.as_bytes();
    match *bytes.first()? {
        b'-' | b'*' | b'+' if bytes.get(1) == Some(&b' ') => Some(2),
        b'0'..=b'9' => {
            let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
            let delim = *bytes.get(digits)?;
            let space = *bytes.get(digits + 1)?;
            (digits <= 9 && matches!(delim, b'.' | b')') && space == b' ').then_some(digits + 2)
        }
        _ => None,
    }
}

fn strip_list_marker(trimmed: &str) -> &str {
    list_marker_len(trimmed)
        .map(|n| &trimmed[n..])
        .unwrap_or(trimmed)
}

fn strip_task_box(item: &str) -> &str {
    for prefix in ["[ ] ", "[x] ", "[X] "] {
        if let Some(rest) = item.strip_prefix(prefix) {
            return rest;
        }
    }
    item
}
