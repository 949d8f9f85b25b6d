//! Completion notice extraction from free-form worker output.
//!
//! Workers print prose, logs and code alongside one small JSON object that
//! describes what they did. Extraction tries, in order:
//!
//! 1. the first balanced JSON object carrying an `"agent"` field that
//!    deserializes as a [`CompletionNotice`]
//! 2. the first fenced code block tagged `json` (or untagged JSON) that
//!    deserializes as a notice
//!
//! Anything else is [`NoticeParse::Unparsed`]. No input makes this panic.

use serde_json::Value;

use conduit_core::CompletionNotice;

/// Result of scanning worker output for a completion notice.
#[derive(Debug, Clone, PartialEq)]
pub enum NoticeParse {
    Parsed(CompletionNotice),
    Unparsed,
}

impl NoticeParse {
    #[must_use]
    pub fn notice(self) -> Option<CompletionNotice> {
        match self {
            Self::Parsed(notice) => Some(notice),
            Self::Unparsed => None,
        }
    }

    #[must_use]
    pub const fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }
}

/// Extract a completion notice from raw stdout.
#[must_use]
pub fn parse_completion_notice(raw: &str) -> NoticeParse {
    first_balanced_notice(raw)
        .or_else(|| first_fenced_notice(raw))
        .map_or(NoticeParse::Unparsed, NoticeParse::Parsed)
}

/// Same as [`parse_completion_notice`] for raw bytes, decoded lossily.
#[must_use]
pub fn parse_completion_notice_bytes(raw: &[u8]) -> NoticeParse {
    parse_completion_notice(&String::from_utf8_lossy(raw))
}

fn first_balanced_notice(raw: &str) -> Option<CompletionNotice> {
    balanced_objects(raw)
        .into_iter()
        .filter_map(|(start, end)| raw.get(start..=end))
        .find_map(notice_from_object)
}

/// `(open, close)` byte offsets of every balanced `{...}` span, ordered by
/// where the span opens.
///
/// One pass with a stack of open braces. Quotes only count inside an open
/// span. A raw newline inside a string cannot occur in JSON, so it drops
/// every open span.
fn balanced_objects(raw: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in raw.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                '\n' => {
                    open.clear();
                    in_string = false;
                }
                _ => {}
            }
            continue;
        }
        match c {
            '"' if !open.is_empty() => in_string = true,
            '{' => open.push(offset),
            '}' => {
                if let Some(start) = open.pop() {
                    spans.push((start, offset));
                }
            }
            _ => {}
        }
    }

    spans.sort_unstable_by_key(|(start, _)| *start);
    spans
}

fn notice_from_object(candidate: &str) -> Option<CompletionNotice> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    if value.get("agent").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn first_fenced_notice(raw: &str) -> Option<CompletionNotice> {
    fenced_blocks(raw)
        .into_iter()
        .filter(|(tag, body)| {
            tag.eq_ignore_ascii_case("json") || (tag.is_empty() && body.trim_start().starts_with('{'))
        })
        .find_map(|(_, body)| serde_json::from_str::<CompletionNotice>(body.trim()).ok())
}

/// `(info string, body)` of every closed ``` block.
fn fenced_blocks(raw: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut open: Option<(String, Vec<&str>)> = None;

    for line in raw.lines() {
        let trimmed = line.trim_start();
        match open.take() {
            None => {
                if let Some(tag) = trimmed.strip_prefix("```") {
                    open = Some((tag.trim().to_string(), Vec::new()));
                }
            }
            Some((tag, mut body)) => {
                if trimmed.starts_with("```") {
                    blocks.push((tag, body.join("\n")));
                } else {
                    body.push(line);
                    open = Some((tag, body));
                }
            }
        }
    }
    blocks
}
