//! Strip reasoning wrappers that chat models emit around their answer.
//!
//! Only the leading segment of the output is touched so translated content
//! that legitimately contains similar tags is left alone.

use once_cell::sync::Lazy;

/// An `(open, close)` tag pair and whether the wrapped content survives
#[derive(Debug, Clone)]
pub struct TagPair {
    pub open: String,
    pub close: String,
    pub keep_inner: bool,
}

impl TagPair {
    pub fn drop(open: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            close: close.to_string(),
            keep_inner: false,
        }
    }

    pub fn keep(open: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            close: close.to_string(),
            keep_inner: true,
        }
    }
}

static BUILTIN_PAIRS: Lazy<Vec<TagPair>> = Lazy::new(|| {
    let mut pairs = Vec::new();
    for name in [
        "think",
        "thinking",
        "thought",
        "reasoning",
        "reflection",
        "internal",
        "scratch",
        "analysis",
        "brainstorm",
    ] {
        pairs.push(TagPair::drop(&format!("<{name}>"), &format!("</{name}>")));
    }
    for name in ["THINKING", "REASONING", "INTERNAL", "SCRATCH"] {
        pairs.push(TagPair::drop(&format!("[{name}]"), &format!("[/{name}]")));
    }
    for name in ["answer", "result", "output"] {
        pairs.push(TagPair::keep(&format!("<{name}>"), &format!("</{name}>")));
    }
    pairs
});

fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            run += 1;
            if run <= 2 {
                out.push(ch);
            }
        } else {
            run = 0;
            out.push(ch);
        }
    }
    out
}

/// Handle one leading tag span. Returns the remaining text when a known
/// opening tag was found, or None when the prefix matches nothing.
fn strip_leading_span(text: &str, pairs: &[TagPair]) -> Option<String> {
    let trimmed = text.trim_start();
    for pair in pairs {
        if let Some(after_open) = trimmed.strip_prefix(pair.open.as_str()) {
            return Some(match after_open.find(pair.close.as_str()) {
                Some(close_at) => {
                    let rest = &after_open[close_at + pair.close.len()..];
                    if pair.keep_inner {
                        let inner = &after_open[..close_at];
                        format!("{inner}{rest}")
                    } else {
                        rest.to_string()
                    }
                }
                // Unclosed opener swallows everything to end-of-string
                None => String::new(),
            });
        }
    }
    None
}

/// Remove leading reasoning wrappers from a model response.
///
/// Idempotent: output never begins with a known opening tag.
pub fn strip_reasoning(text: &str) -> String {
    strip_reasoning_with(text, &[])
}

/// Like [`strip_reasoning`], with caller-supplied tag pairs taking
/// precedence over the built-ins.
pub fn strip_reasoning_with(text: &str, user_pairs: &[TagPair]) -> String {
    let mut current = text.to_string();
    loop {
        let stripped = strip_leading_span(&current, user_pairs)
            .or_else(|| strip_leading_span(&current, &BUILTIN_PAIRS));
        match stripped {
            Some(next) => current = next,
            None => break,
        }
    }
    collapse_newlines(&current).trim().to_string()
}
