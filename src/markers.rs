//! Node boundary markers for batched requests.
//!
//! When several external nodes are concatenated into one backend request,
//! each node is wrapped in a `@@NODE_START_<id>@@` / `@@NODE_END_<id>@@`
//! pair. Cooperating backends echo the markers verbatim and translate only
//! the content between them, so the response can be split back into
//! per-node results.

use crate::error::{Result, TranslateError};
use once_cell::sync::Lazy;
use regex::Regex;

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@@NODE_(START|END)_(\d+)@@").unwrap());

fn start_marker(id: u64) -> String {
    format!("@@NODE_START_{id}@@")
}

fn end_marker(id: u64) -> String {
    format!("@@NODE_END_{id}@@")
}

/// Wrap one node body in its boundary pair.
/// Markers sit on their own line with one newline before and after the body.
pub fn wrap_node(id: u64, body: &str) -> String {
    format!("{}\n{}\n{}", start_marker(id), body, end_marker(id))
}

/// Concatenate nodes into a single batch request body
pub fn assemble_batch(nodes: &[(u64, String)]) -> String {
    nodes
        .iter()
        .map(|(id, body)| wrap_node(*id, body))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Check that every start marker has a matching end marker in order.
///
/// Markers do not nest: a start must be closed by the end with the same id
/// before the next start opens.
pub fn markers_balanced(text: &str) -> bool {
    let mut open: Option<u64> = None;
    for caps in MARKER_RE.captures_iter(text) {
        let id: u64 = match caps[2].parse() {
            Ok(id) => id,
            Err(_) => return false,
        };
        match (&caps[1], open) {
            ("START", None) => open = Some(id),
            ("END", Some(current)) if current == id => open = None,
            _ => return false,
        }
    }
    open.is_none()
}

/// Split a marked-up batch response back into `(id, body)` results.
///
/// Surrounding whitespace that the wire format adds around each body is
/// trimmed; interior whitespace is untouched.
pub fn parse_batch(text: &str) -> Result<Vec<(u64, String)>> {
    let mut results = Vec::new();
    let mut open: Option<(u64, usize)> = None;

    for caps in MARKER_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match always has group 0");
        let id: u64 = caps[2]
            .parse()
            .map_err(|_| TranslateError::validation("node marker id out of range"))?;
        match (&caps[1], open) {
            ("START", None) => open = Some((id, whole.end())),
            ("END", Some((current, body_start))) if current == id => {
                let body = &text[body_start..whole.start()];
                results.push((id, body.trim_matches('\n').to_string()));
                open = None;
            }
            ("START", Some(_)) => {
                return Err(TranslateError::validation(format!(
                    "node marker {id} opened before previous marker closed"
                )));
            }
            _ => {
                return Err(TranslateError::validation(format!(
                    "unmatched node end marker {id}"
                )));
            }
        }
    }

    if let Some((id, _)) = open {
        return Err(TranslateError::validation(format!(
            "node marker {id} never closed"
        )));
    }
    Ok(results)
}
