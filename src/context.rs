//! Per-job ambient values: language pair, preservation options, deadline,
//! cancellation, and progress reporting.

use crate::preserver::PreserveOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Ambient per-job values handed to every step.
///
/// The cancellation token is the single authority for aborting a job: once
/// cancelled, no new step requests are issued and admission waits release
/// immediately. Per-step timeouts shorten the ambient deadline for that step
/// only.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub source_language: String,
    pub target_language: String,
    /// Region/country hint forwarded to prompts (e.g. "Brazil" for pt-BR idiom)
    pub country: Option<String>,
    pub preserve: PreserveOptions,
    /// Wrap multi-node requests in node boundary markers and translate them
    /// as one batch; when off, nodes are translated one request each
    pub node_markers: bool,
    /// Free-form metadata. Keys prefixed with `_` are internal.
    pub metadata: HashMap<String, String>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(source_language: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            source_language: source_language.into(),
            target_language: target_language.into(),
            country: None,
            preserve: PreserveOptions::default(),
            node_markers: false,
            metadata: HashMap::new(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_preserve(mut self, preserve: PreserveOptions) -> Self {
        self.preserve = preserve;
        self
    }

    /// Enable node-marker batching for multi-node requests
    pub fn with_node_markers(mut self, enabled: bool) -> Self {
        self.node_markers = enabled;
        self
    }

    /// Set the ambient deadline as a budget from now
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    /// Attach an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of the whole job
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the token is cancelled or the deadline has passed
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining() == Some(Duration::ZERO)
    }

    /// Time left before the ambient deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clip a candidate duration to the ambient deadline
    pub fn clip(&self, candidate: Duration) -> Duration {
        match self.remaining() {
            Some(rem) => candidate.min(rem),
            None => candidate,
        }
    }

    /// Read an internal metadata value (keys stored with a `_` prefix)
    pub fn internal(&self, key: &str) -> Option<&str> {
        self.metadata.get(&format!("_{key}")).map(String::as_str)
    }

    /// Write an internal metadata value under a `_`-prefixed key
    pub fn set_internal(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(format!("_{key}"), value.into());
    }
}

/// Snapshot emitted at scheduler start, per-chunk completion, and finish.
///
/// Events are idempotent snapshots: `completed` is monotonically
/// non-decreasing but events may arrive out of time order.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub total: usize,
    pub completed: usize,
    pub current_label: String,
    pub percent: f64,
}

impl ProgressEvent {
    pub fn new(total: usize, completed: usize, current_label: impl Into<String>) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        Self {
            total,
            completed,
            current_label: current_label.into(),
            percent,
        }
    }
}

/// Callback invoked with progress snapshots
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
