//! Per-job metrics aggregation.
//!
//! Counters are updated atomically while chunks complete concurrently and
//! snapshotted into a serializable [`JobMetrics`] at the end of the job.
//! Nothing here persists - the cache is the only state the pipeline keeps.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Aggregate metrics returned alongside a job's translated text
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub failed_chunks: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_hits: u64,
    /// Placeholder tokens left unresolved at restoration time
    pub unknown_placeholders: u64,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Concurrent accumulator behind [`JobMetrics`]
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    total_chunks: AtomicU64,
    completed_chunks: AtomicU64,
    failed_chunks: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    cache_hits: AtomicU64,
    unknown_placeholders: AtomicU64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total_chunks(&self, total: u64) {
        self.total_chunks.store(total, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, failed: bool) {
        self.completed_chunks.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_chunks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tokens(&self, tokens_in: u64, tokens_out: u64) {
        self.tokens_in.fetch_add(tokens_in, Ordering::Relaxed);
        self.tokens_out.fetch_add(tokens_out, Ordering::Relaxed);
    }

    pub fn record_cache_hits(&self, hits: u64) {
        self.cache_hits.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn record_unknown_placeholders(&self, count: u64) {
        self.unknown_placeholders.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, duration: Duration) -> JobMetrics {
        JobMetrics {
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            completed_chunks: self.completed_chunks.load(Ordering::Relaxed),
            failed_chunks: self.failed_chunks.load(Ordering::Relaxed),
            tokens_in: self.tokens_in.load(Ordering::Relaxed),
            tokens_out: self.tokens_out.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            unknown_placeholders: self.unknown_placeholders.load(Ordering::Relaxed),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_snapshot() {
        let recorder = MetricsRecorder::new();
        recorder.set_total_chunks(3);
        recorder.record_chunk(false);
        recorder.record_chunk(true);
        recorder.record_tokens(100, 60);
        recorder.record_tokens(50, 40);
        recorder.record_cache_hits(2);
        recorder.record_unknown_placeholders(1);

        let metrics = recorder.snapshot(Duration::from_millis(1234));
        assert_eq!(metrics.total_chunks, 3);
        assert_eq!(metrics.completed_chunks, 2);
        assert_eq!(metrics.failed_chunks, 1);
        assert_eq!(metrics.tokens_in, 150);
        assert_eq!(metrics.tokens_out, 100);
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.unknown_placeholders, 1);
        assert_eq!(metrics.duration_ms, 1234);
    }

    #[test]
    fn test_metrics_serialize_camel_case() {
        let metrics = JobMetrics {
            total_chunks: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("totalChunks").is_some());
        assert!(json.get("unknownPlaceholders").is_some());
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        let recorder = Arc::new(MetricsRecorder::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let recorder = Arc::clone(&recorder);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    recorder.record_chunk(false);
                    recorder.record_tokens(1, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let metrics = recorder.snapshot(Duration::ZERO);
        assert_eq!(metrics.completed_chunks, 400);
        assert_eq!(metrics.tokens_in, 400);
    }
}
