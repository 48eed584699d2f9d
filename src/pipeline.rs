//! Caller-facing pipeline: protect, chunk, fan out chains, reassemble,
//! restore.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::cache::{CacheStore, TranslationCache};
use crate::chain::{ChainRunner, ChainSpec};
use crate::chunker::{ChunkConfig, ChunkStrategy, DefaultChunker, SmartChunker};
use crate::config::PipelineConfig;
use crate::context::{JobContext, ProgressFn};
use crate::error::{Result, TranslateError};
use crate::markers::{assemble_batch, parse_batch};
use crate::metrics::{JobMetrics, MetricsRecorder};
use crate::preserver::PreserveRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::{ErrorCallback, Scheduler};
use crate::step::StepExecutor;

/// Job result: whatever was produced, the metrics, and the first error when
/// the job did not fully succeed.
#[derive(Debug)]
pub struct TranslationOutput {
    pub text: String,
    pub metrics: JobMetrics,
    pub error: Option<TranslateError>,
}

impl TranslationOutput {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Multi-stage translation pipeline over a fixed chain and backend registry
pub struct Translator {
    config: PipelineConfig,
    chain: ChainSpec,
    executor: Arc<StepExecutor>,
    progress: Option<ProgressFn>,
    on_error: Option<ErrorCallback>,
}

impl Translator {
    /// Build a pipeline, validating the chain against the registry.
    ///
    /// The cache is constructed from the configuration: disk-backed when a
    /// directory is set, memory-only otherwise, absent when disabled.
    pub fn new(
        config: PipelineConfig,
        chain: ChainSpec,
        registry: BackendRegistry,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        chain.validate(Some(&registry))?;
        ChunkConfig::new(config.chunk.size, config.chunk.overlap)?;

        let mut executor = StepExecutor::new(Arc::clone(&registry))
            .with_retry_policy(RetryPolicy::from(&config.retry));
        if config.cache.enabled {
            let cache = match &config.cache.dir {
                Some(dir) => TranslationCache::with_disk(dir.clone()),
                None => TranslationCache::memory(),
            };
            let cache = match config.cache.ttl_secs {
                Some(secs) => cache.with_default_ttl(std::time::Duration::from_secs(secs)),
                None => cache,
            };
            executor = executor.with_cache(Arc::new(cache) as Arc<dyn CacheStore>);
        }

        Ok(Self {
            config,
            chain,
            executor: Arc::new(executor),
            progress: None,
            on_error: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error_callback(mut self, on_error: ErrorCallback) -> Self {
        self.on_error = Some(on_error);
        self
    }

    pub fn chain(&self) -> &ChainSpec {
        &self.chain
    }

    fn chunker(&self) -> Box<dyn ChunkStrategy> {
        let chunk_config = self.config.chunk.clone();
        if self.config.smart_chunking {
            Box::new(SmartChunker::new(chunk_config))
        } else {
            Box::new(DefaultChunker::new(chunk_config))
        }
    }

    fn scheduler(&self, semaphore: Option<Arc<Semaphore>>) -> Scheduler {
        let mut scheduler = match semaphore {
            Some(semaphore) => Scheduler::with_semaphore(semaphore),
            None => Scheduler::new(self.config.scheduler.concurrency),
        };
        if let Some(progress) = &self.progress {
            scheduler = scheduler.with_progress(Arc::clone(progress));
        }
        if let Some(on_error) = &self.on_error {
            scheduler = scheduler.with_error_callback(Arc::clone(on_error));
        }
        scheduler
    }

    /// Single-shot translation: chunking, bounded fan-out, ordered
    /// reassembly and placeholder restoration.
    ///
    /// Partial failures do not discard output: the returned
    /// [`TranslationOutput`] carries whatever was produced plus the first
    /// error. Empty input is a validation error.
    pub async fn translate(&self, ctx: &JobContext, text: &str) -> Result<TranslationOutput> {
        self.translate_shared(ctx, text, None).await
    }

    async fn translate_shared(
        &self,
        ctx: &JobContext,
        text: &str,
        semaphore: Option<Arc<Semaphore>>,
    ) -> Result<TranslationOutput> {
        if text.trim().is_empty() {
            return Err(TranslateError::validation("empty input text"));
        }
        let started = Instant::now();
        let recorder = MetricsRecorder::new();

        let mut preserve = PreserveRegistry::new();
        let protected = preserve.protect(text, &ctx.preserve);

        let chunks = self.chunker().chunk(&protected);
        recorder.set_total_chunks(chunks.len() as u64);
        info!(chunks = chunks.len(), "translation job start");

        let runner = Arc::new(ChainRunner::new(
            Arc::clone(&self.executor),
            self.chain.clone(),
        ));
        let outcome = self
            .scheduler(semaphore)
            .run(runner, chunks, Arc::new(ctx.clone()))
            .await;

        for result in outcome.results.iter().flatten() {
            recorder.record_chunk(!result.success);
            recorder.record_tokens(result.tokens_in() as u64, result.tokens_out() as u64);
            let hits = result.steps.iter().filter(|s| s.from_cache).count();
            recorder.record_cache_hits(hits as u64);
        }

        let assembled = outcome.assemble();
        let restored = preserve.restore(&assembled);
        if restored.unknown_placeholders > 0 {
            warn!(
                count = restored.unknown_placeholders,
                "unresolved placeholders left in output"
            );
            recorder.record_unknown_placeholders(restored.unknown_placeholders as u64);
        }

        Ok(TranslationOutput {
            text: restored.text,
            metrics: recorder.snapshot(started.elapsed()),
            error: outcome.first_error,
        })
    }

    /// Convenience form: no chunking, one chain invocation over the whole
    /// text. Fails with the chain's error instead of returning partials.
    pub async fn translate_text(&self, ctx: &JobContext, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(TranslateError::validation("empty input text"));
        }
        let mut preserve = PreserveRegistry::new();
        let protected = preserve.protect(text, &ctx.preserve);

        let runner = ChainRunner::new(Arc::clone(&self.executor), self.chain.clone());
        let mut result = runner.run(&protected, false, ctx).await;
        if let Some(error) = result.error.take() {
            return Err(error);
        }
        let restored = preserve.restore(&result.output);
        if restored.unknown_placeholders > 0 {
            warn!(
                count = restored.unknown_placeholders,
                "unresolved placeholders left in output"
            );
        }
        Ok(restored.text)
    }

    /// Translate several independent inputs, sharing one admission budget
    /// across all of them. Empty inputs yield empty results, not errors.
    pub async fn translate_batch(
        &self,
        ctx: &JobContext,
        texts: &[String],
    ) -> Vec<Result<TranslationOutput>> {
        let semaphore = Arc::new(Semaphore::new(self.config.scheduler.concurrency.max(1)));
        let jobs = texts.iter().map(|text| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                if text.trim().is_empty() {
                    return Ok(TranslationOutput {
                        text: String::new(),
                        metrics: JobMetrics::default(),
                        error: None,
                    });
                }
                self.translate_shared(ctx, text, Some(semaphore)).await
            }
        });
        futures::future::join_all(jobs).await
    }

    /// Translate a set of externally parsed nodes, keyed by id.
    ///
    /// With `ctx.node_markers` set the nodes are concatenated into one
    /// marked-up batch request and the reply is split back by marker id;
    /// otherwise each node runs through the chain as its own request.
    pub async fn translate_nodes(
        &self,
        ctx: &JobContext,
        nodes: &[(u64, String)],
    ) -> Result<Vec<(u64, String)>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let mut preserve = PreserveRegistry::new();
        let protected: Vec<(u64, String)> = nodes
            .iter()
            .map(|(id, body)| (*id, preserve.protect(body, &ctx.preserve)))
            .collect();

        let runner = ChainRunner::new(Arc::clone(&self.executor), self.chain.clone());

        if !ctx.node_markers {
            let mut outputs = Vec::with_capacity(protected.len());
            for (id, body) in &protected {
                let mut result = runner.run(body, false, ctx).await;
                if let Some(error) = result.error.take() {
                    return Err(error);
                }
                outputs.push((*id, preserve.restore(&result.output).text));
            }
            return Ok(outputs);
        }

        let batch = assemble_batch(&protected);
        let mut result = runner.run(&batch, true, ctx).await;
        if let Some(error) = result.error.take() {
            return Err(error);
        }

        let parsed = parse_batch(&result.output)?;
        Ok(parsed
            .into_iter()
            .map(|(id, body)| (id, preserve.restore(&body).text))
            .collect())
    }
}
