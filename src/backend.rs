//! Uniform contract over heterogeneous translation backends.
//!
//! The core only ever sees this trait; concrete adapters (chat-style LLMs,
//! classical MT services, the passthrough stub) are selected by name from a
//! registry at construction time. Language-code normalization is each
//! adapter's own responsibility - the core speaks human-readable names.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TranslateError};

/// One dispatch to a backend
#[derive(Debug, Clone, Default)]
pub struct TranslateRequest {
    /// User-facing message, or raw text for direct MT services
    pub text: String,
    /// System role message for chat backends
    pub system: Option<String>,
    pub source_language: String,
    pub target_language: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub metadata: HashMap<String, String>,
}

/// Backend reply with optional token accounting and provenance
#[derive(Debug, Clone, Default)]
pub struct TranslateResponse {
    pub text: String,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub id: Option<String>,
}

/// Capability descriptor consumed by the chain validator
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Maximum request text length in runes, when the service enforces one
    pub max_text_len: Option<usize>,
    /// Rate limit hint in requests per minute
    pub requests_per_minute: Option<u32>,
    /// Whether node-marker batch requests are worthwhile
    pub supports_batching: bool,
    pub requires_credentials: bool,
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse>;

    /// Identifier used in cache keys and logs
    fn name(&self) -> &str;

    /// Whether this backend can play reflection/improvement roles.
    /// True for chat-style LLMs, false for direct MT services.
    fn supports_steps(&self) -> bool;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// Backend that returns its input unchanged; used to stub out a step
pub struct PassthroughBackend;

#[async_trait]
impl BackendAdapter for PassthroughBackend {
    async fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse> {
        Ok(TranslateResponse {
            text: request.text,
            ..Default::default()
        })
    }

    fn name(&self) -> &str {
        "raw"
    }

    fn supports_steps(&self) -> bool {
        true
    }
}

/// String-keyed adapter registry
#[derive(Default)]
pub struct BackendRegistry {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl BackendRegistry {
    /// Empty registry with the passthrough backend pre-registered
    pub fn new() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(Arc::new(PassthroughBackend));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters.get(name).cloned().ok_or_else(|| {
            TranslateError::config(format!("unknown backend \"{name}\""))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
