//! Content preservation: replace spans that must survive translation verbatim
//! with opaque `@@PRESERVE_<n>@@` placeholders, and restore them afterwards.
//!
//! The registry is per-job and single-writer: only the job's protection pass
//! allocates placeholders, steps merely echo them, and restoration happens
//! once at the end.

use once_cell::sync::Lazy;
use regex::Regex;

// Lazy-compiled regexes (compiled once, reused)
static FENCED_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[\s\S]*?```|~~~[\s\S]*?~~~").unwrap());
static INLINE_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`\n]+`").unwrap());
static DISPLAY_MATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\$[\s\S]*?\$\$|\\\[[\s\S]*?\\\]").unwrap());
static INLINE_MATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$[^$\n]+\$|\\\([^\n]*?\\\)").unwrap());
// Stop at whitespace or URL-unsafe delimiters
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"\{\}\|\^\[\]]+"#).unwrap());
static CITATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+(?:[,-]\d+)*\]").unwrap());

// Placeholder tokens as they appear in step inputs and outputs
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@@PRESERVE_(\d+)@@").unwrap());

/// Which protected classes the registry applies, in fixed precedence
#[derive(Debug, Clone)]
pub struct PreserveOptions {
    pub fenced_code: bool,
    pub inline_code: bool,
    pub display_math: bool,
    pub inline_math: bool,
    pub urls: bool,
    pub citations: bool,
}

impl Default for PreserveOptions {
    fn default() -> Self {
        Self {
            fenced_code: true,
            inline_code: true,
            display_math: true,
            inline_math: true,
            urls: true,
            citations: true,
        }
    }
}

impl PreserveOptions {
    /// Disable every protector; placeholders can still be allocated manually
    pub fn none() -> Self {
        Self {
            fenced_code: false,
            inline_code: false,
            display_math: false,
            inline_math: false,
            urls: false,
            citations: false,
        }
    }
}

/// Result of restoring placeholders back into a text
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub text: String,
    /// Placeholder tokens found in the text with no registered original.
    /// Left verbatim; surfaced as a warning count in job metadata.
    pub unknown_placeholders: usize,
}

/// Per-job placeholder registry.
///
/// Placeholder numbers are monotonic from 0 and never reused within a job.
/// The registry must not be shared across concurrent jobs.
#[derive(Debug, Default)]
pub struct PreserveRegistry {
    originals: Vec<String>,
}

impl PreserveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.originals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }

    fn placeholder(n: usize) -> String {
        format!("@@PRESERVE_{n}@@")
    }

    /// Allocate a fresh placeholder for an arbitrary span
    pub fn allocate(&mut self, original: impl Into<String>) -> String {
        let token = Self::placeholder(self.originals.len());
        self.originals.push(original.into());
        token
    }

    /// Look up the original substring for a placeholder number
    pub fn original(&self, n: usize) -> Option<&str> {
        self.originals.get(n).map(String::as_str)
    }

    fn apply_pass(&mut self, text: &str, regex: &Regex) -> String {
        regex
            .replace_all(text, |caps: &regex::Captures| self.allocate(&caps[0]))
            .into_owned()
    }

    /// Replace every protected span with a freshly allocated placeholder.
    ///
    /// Passes run in precedence order; later passes cannot look inside
    /// already-protected spans because placeholders contain none of the
    /// delimiters the patterns anchor on.
    pub fn protect(&mut self, text: &str, options: &PreserveOptions) -> String {
        let mut result = text.to_string();
        if options.fenced_code {
            result = self.apply_pass(&result, &FENCED_CODE_RE);
        }
        if options.inline_code {
            result = self.apply_pass(&result, &INLINE_CODE_RE);
        }
        if options.display_math {
            result = self.apply_pass(&result, &DISPLAY_MATH_RE);
        }
        if options.inline_math {
            result = self.apply_pass(&result, &INLINE_MATH_RE);
        }
        if options.urls {
            result = self.apply_pass(&result, &URL_RE);
        }
        if options.citations {
            result = self.apply_pass(&result, &CITATION_RE);
        }
        result
    }

    /// Replace placeholders by their original substrings.
    ///
    /// Restoration walks placeholders in descending numeric order so a
    /// restored span that happens to contain an earlier token is not
    /// re-substituted. Unknown placeholders are left verbatim and counted.
    pub fn restore(&self, text: &str) -> RestoreOutcome {
        let mut result = text.to_string();
        for (n, original) in self.originals.iter().enumerate().rev() {
            result = result.replace(&Self::placeholder(n), original);
        }

        let unknown_placeholders = PLACEHOLDER_RE
            .captures_iter(&result)
            .filter(|caps| {
                caps.get(1)
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .map_or(true, |n| n >= self.originals.len())
            })
            .count();

        RestoreOutcome {
            text: result,
            unknown_placeholders,
        }
    }
}
