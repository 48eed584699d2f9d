//! Multi-stage translation pipeline.
//!
//! Orchestrates LLM and classical MT backends through a configurable chain
//! of steps (typically initial translation, reflection, improvement) over
//! size-bounded chunks, with bounded-parallel dispatch, content
//! preservation, a fingerprint-keyed two-tier cache, reasoning-marker
//! stripping, and retry with error classification.
//!
//! ```no_run
//! use lingua_chain::{
//!     BackendRegistry, ChainSpec, JobContext, PipelineConfig, StepKind, Translator,
//! };
//!
//! # async fn run() -> lingua_chain::Result<()> {
//! let registry = BackendRegistry::new();
//! let chain = ChainSpec::single("initial", "raw", StepKind::Passthrough);
//! let translator = Translator::new(PipelineConfig::default(), chain, registry)?;
//!
//! let ctx = JobContext::new("English", "Chinese");
//! let output = translator.translate(&ctx, "Hello, world.").await?;
//! println!("{} ({} chunks)", output.text, output.metrics.total_chunks);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod chain;
pub mod chat_api;
pub mod chunker;
pub mod config;
pub mod context;
pub mod error;
pub mod markers;
pub mod metrics;
pub mod pipeline;
pub mod preserver;
pub mod prompt;
pub mod reasoning;
pub mod retry;
pub mod scheduler;
pub mod step;

pub use backend::{
    BackendAdapter, BackendRegistry, Capabilities, PassthroughBackend, TranslateRequest,
    TranslateResponse,
};
pub use cache::{cache_key, step_fingerprint, CacheStats, CacheStore, TranslationCache};
pub use chain::{ChainResult, ChainRunner, ChainSpec};
pub use chat_api::{ChatApiBackend, ChatApiConfig};
pub use chunker::{
    detect_content_kind, Chunk, ChunkConfig, ChunkStrategy, ContentKind, DefaultChunker,
    NodeSplitter, SmartChunker,
};
pub use config::{CacheConfig, PipelineConfig, RetryConfig, SchedulerConfig};
pub use context::{JobContext, ProgressEvent, ProgressFn};
pub use error::{ErrorKind, Result, TranslateError};
pub use markers::{assemble_batch, markers_balanced, parse_batch, wrap_node};
pub use metrics::JobMetrics;
pub use pipeline::{TranslationOutput, Translator};
pub use preserver::{PreserveOptions, PreserveRegistry, RestoreOutcome};
pub use reasoning::{strip_reasoning, strip_reasoning_with, TagPair};
pub use retry::{RateLimiter, RetryPolicy};
pub use scheduler::{join_chunks, ErrorCallback, JobOutcome, Scheduler};
pub use step::{StepExecutor, StepKind, StepResult, StepSpec};
