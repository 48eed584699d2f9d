//! Bounded-parallel execution of chains over chunks with ordered reassembly.
//!
//! A semaphore of capacity K gates admission; each task holds its permit
//! through all of its retries. Results land at their chunk index so the
//! assembled output is identical for every K, and cancellation releases all
//! admission waits immediately.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chain::{ChainResult, ChainRunner};
use crate::chunker::Chunk;
use crate::context::{JobContext, ProgressEvent, ProgressFn};
use crate::error::TranslateError;

/// Callback receiving every individual chunk failure
pub type ErrorCallback = Arc<dyn Fn(usize, &TranslateError) + Send + Sync>;

/// Punctuation that makes two chunks concatenate without a joining space
const JOIN_PUNCT: &[char] = &[
    '.', '!', '?', ',', ';', ':', '。', '！', '？', '，', '；', '：',
];

/// Join chunk outputs in index order: a single space between two chunks
/// unless either side already touches sentence punctuation.
pub fn join_chunks<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if out.is_empty() {
            out.push_str(part);
            continue;
        }
        let left_ends_punct = out.chars().next_back().is_some_and(|c| JOIN_PUNCT.contains(&c));
        let right_starts_punct = part.chars().next().is_some_and(|c| JOIN_PUNCT.contains(&c));
        if !left_ends_punct && !right_starts_punct {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

/// Aggregate outcome of a scheduled job
pub struct JobOutcome {
    /// Chain results slotted by chunk index; None for chunks never started
    pub results: Vec<Option<ChainResult>>,
    /// First per-chunk error encountered, surfaced as the job error
    pub first_error: Option<TranslateError>,
    pub completed: usize,
    pub failed: usize,
}

impl JobOutcome {
    /// Assembled output under the punctuation-aware join rule
    pub fn assemble(&self) -> String {
        join_chunks(
            self.results
                .iter()
                .flatten()
                .map(|r| r.output.as_str()),
        )
    }
}

/// Bounded-parallel cooperative scheduler
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    progress: Option<ProgressFn>,
    on_error: Option<ErrorCallback>,
}

pub const DEFAULT_CONCURRENCY: usize = 4;

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            progress: None,
            on_error: None,
        }
    }

    /// Share an admission semaphore with other schedulers (batch mode)
    pub fn with_semaphore(semaphore: Arc<Semaphore>) -> Self {
        Self {
            semaphore,
            progress: None,
            on_error: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error_callback(mut self, on_error: ErrorCallback) -> Self {
        self.on_error = Some(on_error);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    /// Run the chain over every chunk with bounded parallelism.
    ///
    /// Chunk failures do not stop the job: the first error is recorded for
    /// the job result and remaining chunks still complete, unless the
    /// ambient deadline cancels everything.
    pub async fn run(
        &self,
        runner: Arc<ChainRunner>,
        chunks: Vec<Chunk>,
        ctx: Arc<JobContext>,
    ) -> JobOutcome {
        let total = chunks.len();
        let mut results: Vec<Option<ChainResult>> = Vec::new();
        results.resize_with(total, || None);

        info!(total, "scheduler start");
        self.emit(ProgressEvent::new(total, 0, "start"));

        let mut tasks: JoinSet<(usize, ChainResult)> = JoinSet::new();
        let mut admitted = 0usize;

        for chunk in chunks {
            if ctx.is_cancelled() {
                warn!(index = chunk.index, "cancelled before admission");
                break;
            }
            let permit = tokio::select! {
                _ = ctx.cancellation().cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let runner = Arc::clone(&runner);
            let ctx = Arc::clone(&ctx);
            admitted += 1;
            tasks.spawn(async move {
                // Held through the whole chain including retries
                let _permit = permit;
                let result = runner.run(&chunk.text, false, &ctx).await;
                (chunk.index, result)
            });
        }

        let mut first_error: Option<TranslateError> = None;
        let mut completed = 0usize;
        let mut failed = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, mut result)) => {
                    completed += 1;
                    debug!(index, completed, total, "chunk complete");
                    if let Some(error) = result.error.take() {
                        failed += 1;
                        if let Some(on_error) = &self.on_error {
                            on_error(index, &error);
                        }
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                    self.emit(ProgressEvent::new(
                        total,
                        completed,
                        format!("chunk {index}"),
                    ));
                    if let Some(slot) = results.get_mut(index) {
                        *slot = Some(result);
                    }
                }
                Err(join_error) => {
                    completed += 1;
                    failed += 1;
                    warn!(error = %join_error, "chunk task aborted");
                    if first_error.is_none() {
                        first_error = Some(TranslateError::chain(format!(
                            "chunk task aborted: {join_error}"
                        )));
                    }
                }
            }
        }

        if admitted < total && first_error.is_none() {
            first_error = Some(TranslateError::cancelled());
        }

        info!(completed, failed, total, "scheduler finish");
        self.emit(ProgressEvent::new(total, completed, "finish"));

        JobOutcome {
            results,
            first_error,
            completed,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAdapter, BackendRegistry, TranslateRequest, TranslateResponse};
    use crate::chain::ChainSpec;
    use crate::retry::RetryPolicy;
    use crate::step::{StepExecutor, StepKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Uppercases its input, tracking peak concurrency
    struct UppercaseBackend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl UppercaseBackend {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for UppercaseBackend {
        async fn translate(
            &self,
            request: TranslateRequest,
        ) -> crate::error::Result<TranslateResponse> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(marker) = self.fail_on {
                if request.text.contains(marker) {
                    return Err(TranslateError::llm("HTTP 400 Bad Request"));
                }
            }
            // Echo the payload between the template preamble and markers
            let body = request
                .text
                .lines()
                .last()
                .unwrap_or_default()
                .to_uppercase();
            Ok(TranslateResponse {
                text: body,
                ..Default::default()
            })
        }
        fn name(&self) -> &str {
            "upper"
        }
        fn supports_steps(&self) -> bool {
            true
        }
    }

    fn runner(backend: UppercaseBackend) -> Arc<ChainRunner> {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(backend));
        let executor = StepExecutor::new(Arc::new(registry)).with_retry_policy(RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        });
        Arc::new(ChainRunner::new(
            Arc::new(executor),
            ChainSpec::single("upper", "m", StepKind::Llm),
        ))
    }

    fn chunks_of(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                index,
                text: text.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_join_rule_space_between_words() {
        assert_eq!(join_chunks(["hello", "world"]), "hello world");
    }

    #[test]
    fn test_join_rule_direct_after_punctuation() {
        assert_eq!(join_chunks(["First.", "Second"]), "First.Second");
        assert_eq!(join_chunks(["head", ",tail"]), "head,tail");
        assert_eq!(join_chunks(["句子。", "下一句"]), "句子。下一句");
    }

    #[test]
    fn test_join_skips_empty_parts() {
        assert_eq!(join_chunks(["a", "", "b"]), "a b");
        assert_eq!(join_chunks::<[&str; 0]>([]), "");
    }

    #[tokio::test]
    async fn test_ordered_reassembly_any_concurrency() {
        let texts = ["alpha", "bravo", "charlie", "delta", "echo"];
        let mut serial: Option<String> = None;
        for k in [1, 2, 4, 8] {
            let scheduler = Scheduler::new(k);
            let outcome = scheduler
                .run(
                    runner(UppercaseBackend::new()),
                    chunks_of(&texts),
                    Arc::new(JobContext::new("en", "zh")),
                )
                .await;
            assert_eq!(outcome.completed, 5);
            assert_eq!(outcome.failed, 0);
            let assembled = outcome.assemble();
            assert!(assembled.find("ALPHA").unwrap() < assembled.find("BRAVO").unwrap());
            match &serial {
                None => serial = Some(assembled),
                Some(expected) => assert_eq!(&assembled, expected, "K={k} differs from serial"),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_k() {
        let backend = UppercaseBackend::new();
        let mut registry = BackendRegistry::new();
        let backend = Arc::new(backend);
        registry.register(Arc::clone(&backend) as Arc<dyn BackendAdapter>);
        let executor = StepExecutor::new(Arc::new(registry));
        let chain_runner = Arc::new(ChainRunner::new(
            Arc::new(executor),
            ChainSpec::single("upper", "m", StepKind::Llm),
        ));

        let texts: Vec<String> = (0..12).map(|i| format!("text {i}")).collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let scheduler = Scheduler::new(3);
        let outcome = scheduler
            .run(
                chain_runner,
                chunks_of(&text_refs),
                Arc::new(JobContext::new("en", "zh")),
            )
            .await;
        assert_eq!(outcome.completed, 12);
        assert!(backend.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_first_error_recorded_others_complete() {
        let mut backend = UppercaseBackend::new();
        backend.fail_on = Some("bravo");
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);
        let scheduler = Scheduler::new(2).with_error_callback(Arc::new(move |index, _err| {
            seen.lock().unwrap().push(index);
        }));
        let outcome = scheduler
            .run(
                runner(backend),
                chunks_of(&["alpha", "bravo", "charlie"]),
                Arc::new(JobContext::new("en", "zh")),
            )
            .await;
        assert_eq!(outcome.completed, 3);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.first_error.is_some());
        assert_eq!(*failures.lock().unwrap(), vec![1]);
        // Best-effort completion: the healthy chunks produced output
        let assembled = outcome.assemble();
        assert!(assembled.contains("ALPHA"));
        assert!(assembled.contains("CHARLIE"));
    }

    #[tokio::test]
    async fn test_progress_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let scheduler = Scheduler::new(2).with_progress(Arc::new(move |ev| {
            sink.lock().unwrap().push((ev.completed, ev.percent));
        }));
        scheduler
            .run(
                runner(UppercaseBackend::new()),
                chunks_of(&["a", "b"]),
                Arc::new(JobContext::new("en", "zh")),
            )
            .await;
        let events = events.lock().unwrap();
        // start + 2 completions + finish
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], (0, 0.0));
        assert_eq!(events[3], (2, 100.0));
        // Completed counts never decrease
        for pair in events.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_admission() {
        let ctx = Arc::new(JobContext::new("en", "zh"));
        ctx.cancel();
        let scheduler = Scheduler::new(2);
        let outcome = scheduler
            .run(
                runner(UppercaseBackend::new()),
                chunks_of(&["a", "b", "c"]),
                Arc::clone(&ctx),
            )
            .await;
        assert_eq!(outcome.completed, 0);
        assert!(outcome.first_error.unwrap().is_cancellation());
    }
}
