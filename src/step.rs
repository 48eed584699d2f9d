//! Single-step execution: build the request, consult the cache, enforce the
//! timeout, dispatch to the backend, clean the response, record the result.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::backend::{BackendRegistry, TranslateRequest, TranslateResponse};
use crate::cache::{cache_key, step_fingerprint, CacheStore};
use crate::context::JobContext;
use crate::error::{Result, TranslateError};
use crate::prompt::{assemble, TemplateKind};
use crate::reasoning::strip_reasoning;
use crate::retry::{retry, RateLimiter, RetryPolicy};

/// What kind of backend a step runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Chat-style model that can translate, review or improve
    Llm,
    /// Classical MT service; initial translation only
    DirectMt,
    /// Returns its input unchanged
    Passthrough,
}

/// One configured step of a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub name: String,
    pub backend: String,
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-step timeout; shortens the ambient deadline for this step only
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub additional_notes: String,

    pub kind: StepKind,
}

const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_MAX_TOKENS: u32 = 4096;

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl StepSpec {
    pub fn new(name: impl Into<String>, backend: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            model: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: None,
            additional_notes: String::new(),
            kind,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Outcome of one step over one chunk
#[derive(Debug, Clone)]
pub struct StepResult {
    pub name: String,
    pub model: String,
    pub output: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub duration: Duration,
    pub from_cache: bool,
    pub error: Option<String>,
}

/// Per-invocation input assembled by the chain runner
#[derive(Debug, Clone)]
pub struct StepInput {
    /// Chunk-level input text for this step; also the fingerprint text
    pub text: String,
    pub template: TemplateKind,
    /// Positional variable bindings for the prompt templates
    pub vars: HashMap<String, String>,
    /// Whether the text is a node-marker batch
    pub batch: bool,
    /// Relevant prior-step outputs, mixed into the cache fingerprint
    pub cache_context: Option<String>,
}

/// Leading preambles some models add despite instructions.
/// Longest first so "Translation:" does not shadow the longer forms.
const PREAMBLES: &[&str] = &[
    "here is the translation:",
    "translated text:",
    "translation:",
];

fn strip_preamble(text: &str) -> &str {
    let mut out = text.trim_start();
    for prefix in PREAMBLES {
        if let Some(head) = out.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                out = out[prefix.len()..].trim_start();
                break;
            }
        }
    }
    out
}

/// Unwrap a response that is entirely one fenced code block
fn unwrap_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") || !trimmed.ends_with("```") || trimmed.len() < 6 {
        return trimmed;
    }
    let Some(first_newline) = trimmed.find('\n') else {
        return trimmed;
    };
    let inner = &trimmed[first_newline + 1..trimmed.len() - 3];
    inner.trim_matches('\n')
}

fn clean_response(raw: &str) -> String {
    let stripped = strip_reasoning(raw);
    let stripped = strip_preamble(&stripped);
    unwrap_fence(stripped).to_string()
}

/// Executes one step against one backend
pub struct StepExecutor {
    registry: Arc<BackendRegistry>,
    cache: Option<Arc<dyn CacheStore>>,
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl StepExecutor {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            cache: None,
            policy: RetryPolicy::default(),
            limiter: Arc::new(RateLimiter::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    fn fingerprint_key(&self, spec: &StepSpec, input: &StepInput, ctx: &JobContext) -> String {
        let fingerprint = step_fingerprint(
            &spec.name,
            &spec.backend,
            &spec.model,
            &ctx.source_language,
            &ctx.target_language,
            spec.temperature,
            spec.max_tokens,
            &input.text,
            input.cache_context.as_deref(),
        );
        cache_key(&fingerprint)
    }

    /// One dispatch with the step timeout layered inside the ambient
    /// deadline. Cancellation aborts immediately.
    async fn dispatch_once(
        &self,
        spec: &StepSpec,
        request: TranslateRequest,
        ctx: &JobContext,
    ) -> Result<TranslateResponse> {
        let backend = self.registry.get(&spec.backend)?;
        let limit = match (spec.timeout(), ctx.remaining()) {
            (Some(step), Some(ambient)) => Some(step.min(ambient)),
            (Some(step), None) => Some(step),
            (None, ambient) => ambient,
        };

        let call = backend.translate(request);
        match limit {
            Some(limit) => tokio::select! {
                _ = ctx.cancellation().cancelled() => Err(TranslateError::cancelled()),
                outcome = tokio::time::timeout(limit, call) => match outcome {
                    Ok(result) => result,
                    Err(_) if ctx.remaining() == Some(Duration::ZERO) => {
                        Err(TranslateError::deadline_exceeded())
                    }
                    Err(_) => Err(TranslateError::timeout(format!(
                        "step timed out after {}s",
                        limit.as_secs()
                    ))),
                },
            },
            None => tokio::select! {
                _ = ctx.cancellation().cancelled() => Err(TranslateError::cancelled()),
                result = call => result,
            },
        }
    }

    pub async fn execute(
        &self,
        spec: &StepSpec,
        input: &StepInput,
        ctx: &JobContext,
    ) -> Result<StepResult> {
        let started = Instant::now();

        if spec.kind == StepKind::Passthrough {
            return Ok(StepResult {
                name: spec.name.clone(),
                model: spec.model.clone(),
                output: input.text.clone(),
                tokens_in: 0,
                tokens_out: 0,
                duration: started.elapsed(),
                from_cache: false,
                error: None,
            });
        }

        let key = self.fingerprint_key(spec, input, ctx);
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(&key) {
                debug!(step = %spec.name, "cache hit");
                return Ok(StepResult {
                    name: spec.name.clone(),
                    model: spec.model.clone(),
                    output: value,
                    tokens_in: 0,
                    tokens_out: 0,
                    duration: started.elapsed(),
                    from_cache: true,
                    error: None,
                });
            }
        }

        // Direct MT services get the raw text; chat backends get the
        // assembled prompt pair.
        let request = match spec.kind {
            StepKind::Llm => {
                let prompt = assemble(
                    &spec.name,
                    input.template,
                    &input.vars,
                    input.batch,
                    &spec.additional_notes,
                );
                TranslateRequest {
                    text: prompt.user,
                    system: Some(prompt.system),
                    source_language: ctx.source_language.clone(),
                    target_language: ctx.target_language.clone(),
                    model: Some(spec.model.clone()),
                    temperature: Some(spec.temperature),
                    max_tokens: Some(spec.max_tokens),
                    metadata: ctx.metadata.clone(),
                }
            }
            StepKind::DirectMt => TranslateRequest {
                text: input.text.clone(),
                system: None,
                source_language: ctx.source_language.clone(),
                target_language: ctx.target_language.clone(),
                model: None,
                temperature: None,
                max_tokens: None,
                metadata: ctx.metadata.clone(),
            },
            StepKind::Passthrough => unreachable!("handled above"),
        };

        let response = retry(&self.policy, &self.limiter, ctx, |_attempt| {
            let request = request.clone();
            async move { self.dispatch_once(spec, request, ctx).await }
        })
        .await
        .map_err(|e| e.with_step(spec.name.clone()))?;

        let output = clean_response(&response.text);
        if let Some(cache) = &self.cache {
            cache.set(&key, output.clone());
        }

        Ok(StepResult {
            name: spec.name.clone(),
            model: response.model.unwrap_or_else(|| spec.model.clone()),
            output,
            tokens_in: response.tokens_in.unwrap_or(0),
            tokens_out: response.tokens_out.unwrap_or(0),
            duration: started.elapsed(),
            from_cache: false,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendAdapter;
    use crate::cache::TranslationCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: pops one canned reply per call
    struct ScriptedBackend {
        name: String,
        script: Vec<std::result::Result<String, u16>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(name: &str, script: Vec<std::result::Result<String, u16>>) -> Self {
            Self {
                name: name.to_string(),
                script,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for ScriptedBackend {
        async fn translate(&self, _request: TranslateRequest) -> Result<TranslateResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.script.get(n.min(self.script.len() - 1)).cloned();
            match reply {
                Some(Ok(text)) => Ok(TranslateResponse {
                    text,
                    tokens_in: Some(10),
                    tokens_out: Some(5),
                    ..Default::default()
                }),
                Some(Err(status)) => Err(TranslateError::from_status(
                    reqwest::StatusCode::from_u16(status).unwrap(),
                )),
                None => Err(TranslateError::llm("script exhausted")),
            }
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn supports_steps(&self) -> bool {
            true
        }
    }

    fn executor_with(backend: ScriptedBackend) -> StepExecutor {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(backend));
        StepExecutor::new(Arc::new(registry)).with_retry_policy(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        })
    }

    fn input(text: &str) -> StepInput {
        let mut vars = HashMap::new();
        vars.insert("text".to_string(), text.to_string());
        StepInput {
            text: text.to_string(),
            template: TemplateKind::Standard,
            vars,
            batch: false,
            cache_context: None,
        }
    }

    fn llm_step(backend: &str) -> StepSpec {
        StepSpec::new("initial", backend, StepKind::Llm).with_model("test-model")
    }

    #[test]
    fn test_strip_preamble() {
        assert_eq!(strip_preamble("Translation: 你好"), "你好");
        assert_eq!(strip_preamble("Here is the translation: 你好"), "你好");
        assert_eq!(strip_preamble("Translated text:\n你好"), "你好");
        assert_eq!(strip_preamble("no preamble"), "no preamble");
        // Only the leading preamble goes; interior mentions survive
        assert_eq!(
            strip_preamble("translation: see Translation: note"),
            "see Translation: note"
        );
    }

    #[test]
    fn test_unwrap_fence() {
        assert_eq!(unwrap_fence("```\ninner text\n```"), "inner text");
        assert_eq!(unwrap_fence("```markdown\n# Title\n```"), "# Title");
        assert_eq!(unwrap_fence("prefix ```\nx\n```"), "prefix ```\nx\n```");
        assert_eq!(unwrap_fence("plain"), "plain");
    }

    #[test]
    fn test_clean_response_pipeline() {
        let raw = "<think>pondering</think>\nTranslation: ```\n译文\n```";
        assert_eq!(clean_response(raw), "译文");
    }

    #[tokio::test]
    async fn test_passthrough_step() {
        let executor = executor_with(ScriptedBackend::new("unused", vec![]));
        let spec = StepSpec::new("noop", "raw", StepKind::Passthrough);
        let ctx = JobContext::new("en", "zh");
        let result = executor.execute(&spec, &input("as-is"), &ctx).await.unwrap();
        assert_eq!(result.output, "as-is");
        assert_eq!(result.tokens_in, 0);
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn test_execute_llm_step() {
        let executor = executor_with(ScriptedBackend::new("mock", vec![Ok("译文".into())]));
        let ctx = JobContext::new("English", "Chinese");
        let result = executor
            .execute(&llm_step("mock"), &input("Hello"), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "译文");
        assert_eq!(result.tokens_in, 10);
        assert_eq!(result.tokens_out, 5);
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn test_cache_hit_second_invocation() {
        let backend = ScriptedBackend::new("mock", vec![Ok("cached value".into())]);
        let executor =
            executor_with(backend).with_cache(Arc::new(TranslationCache::memory()));
        let ctx = JobContext::new("en", "zh");
        let spec = llm_step("mock");

        let first = executor.execute(&spec, &input("Hello"), &ctx).await.unwrap();
        assert!(!first.from_cache);

        let second = executor.execute(&spec, &input("Hello"), &ctx).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.output, first.output);
        assert_eq!(second.tokens_in, 0);
        assert_eq!(second.tokens_out, 0);
    }

    #[tokio::test]
    async fn test_cache_context_distinguishes_steps() {
        let backend = ScriptedBackend::new(
            "mock",
            vec![Ok("first".into()), Ok("second".into())],
        );
        let executor =
            executor_with(backend).with_cache(Arc::new(TranslationCache::memory()));
        let ctx = JobContext::new("en", "zh");
        let spec = llm_step("mock");

        let plain = input("Hello");
        let mut with_context = input("Hello");
        with_context.cache_context = Some("prior output".into());

        let a = executor.execute(&spec, &plain, &ctx).await.unwrap();
        let b = executor.execute(&spec, &with_context, &ctx).await.unwrap();
        assert_eq!(a.output, "first");
        assert_eq!(b.output, "second");
        assert!(!b.from_cache);
    }

    #[tokio::test]
    async fn test_retry_on_429_then_ok() {
        let backend = ScriptedBackend::new(
            "flaky",
            vec![Err(429), Err(429), Ok("ok".into())],
        );
        let executor = executor_with(backend);
        let ctx = JobContext::new("en", "zh");
        let result = executor
            .execute(&llm_step("flaky"), &input("Hello"), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "ok");
    }

    #[tokio::test]
    async fn test_terminal_error_carries_step_name() {
        let backend = ScriptedBackend::new("broken", vec![Err(400)]);
        let executor = executor_with(backend);
        let ctx = JobContext::new("en", "zh");
        let err = executor
            .execute(&llm_step("broken"), &input("Hello"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some("initial"));
    }

    #[tokio::test]
    async fn test_reasoning_and_preamble_cleanup() {
        let backend = ScriptedBackend::new(
            "verbose",
            vec![Ok("<think>internal</think>\n\nTranslation: 译文".into())],
        );
        let executor = executor_with(backend);
        let ctx = JobContext::new("en", "zh");
        let result = executor
            .execute(&llm_step("verbose"), &input("Hello"), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "译文");
    }

    #[test]
    fn test_step_spec_serde_defaults() {
        let json = r#"{"name":"initial","backend":"openai","kind":"llm"}"#;
        let spec: StepSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(spec.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(spec.timeout_secs.is_none());
        assert_eq!(spec.kind, StepKind::Llm);

        let json = r#"{"name":"mt","backend":"deepl","kind":"direct-mt"}"#;
        let spec: StepSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, StepKind::DirectMt);
    }
}
