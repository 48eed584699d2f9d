//! Two-tier, write-through translation cache keyed by step fingerprint.
//!
//! Tier 1 is an in-process map; tier 2 is an optional directory holding one
//! JSON file per key named `<md5hex>.cache`. Reads check memory first, then
//! disk (promoting into memory on hit). Expired entries count as misses and
//! are removed on observation.

use chrono::Utc;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

/// Cached value with creation time and optional TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: String,
    /// Unix seconds at creation
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            timestamp: Utc::now().timestamp(),
            ttl: ttl.map(|d| d.as_secs()),
        }
    }

    fn expired(&self, now: i64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(self.timestamp) > ttl as i64,
            None => false,
        }
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Store contract the executor depends on
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn set_with_ttl(&self, key: &str, value: String, ttl: Duration);
    fn delete(&self, key: &str);
    fn clear(&self);
    fn stats(&self) -> CacheStats;
}

/// Canonical fingerprint string for one step invocation.
///
/// Temperature is fixed to two decimals so tuning changes produce distinct
/// keys; `extra` concatenates the relevant prior-step outputs.
#[allow(clippy::too_many_arguments)]
pub fn step_fingerprint(
    step: &str,
    provider: &str,
    model: &str,
    source_language: &str,
    target_language: &str,
    temperature: f32,
    max_tokens: u32,
    text: &str,
    extra: Option<&str>,
) -> String {
    let mut fingerprint = format!(
        "step:{step}|provider:{provider}|model:{model}|src:{source_language}|tgt:{target_language}|temp:{temperature:.2}|tokens:{max_tokens}|text:{text}"
    );
    if let Some(extra) = extra {
        fingerprint.push_str("|context:");
        fingerprint.push_str(extra);
    }
    fingerprint
}

/// Lowercase hex MD5 of a fingerprint string
pub fn cache_key(fingerprint: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

/// Default disk tier location under the platform cache directory
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lingua-chain")
}

/// Process-local two-tier cache, safe for concurrent readers and writers
pub struct TranslationCache {
    memory: RwLock<HashMap<String, CacheEntry>>,
    disk_dir: Option<PathBuf>,
    /// Set once the disk directory could not be created; memory-only after
    disk_failed: AtomicBool,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TranslationCache {
    /// Memory-only cache
    pub fn memory() -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            disk_dir: None,
            disk_failed: AtomicBool::new(false),
            default_ttl: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Two-tier cache persisting under `dir`.
    /// The directory is created lazily on first write; if creation fails the
    /// cache degrades to memory-only.
    pub fn with_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk_dir: Some(dir.into()),
            ..Self::memory()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        if self.disk_failed.load(Ordering::Acquire) {
            return None;
        }
        self.disk_dir.as_ref().map(|dir| dir.join(format!("{key}.cache")))
    }

    fn ensure_disk_dir(&self) -> Option<&Path> {
        if self.disk_failed.load(Ordering::Acquire) {
            return None;
        }
        let dir = self.disk_dir.as_deref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "cache directory unavailable, memory-only");
            self.disk_failed.store(true, Ordering::Release);
            return None;
        }
        Some(dir)
    }

    fn read_disk(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key)?;
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Some(entry),
            Err(_) => {
                // Undecodable entry file: treat as a miss and remove
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    fn write_disk(&self, key: &str, entry: &CacheEntry) {
        if self.ensure_disk_dir().is_none() {
            return;
        }
        let Some(path) = self.entry_path(key) else {
            return;
        };
        if let Ok(bytes) = serde_json::to_vec(entry) {
            if let Err(e) = std::fs::write(&path, bytes) {
                warn!(key, error = %e, "disk cache write failed");
            }
        }
    }

    fn remove_disk(&self, key: &str) {
        if let Some(path) = self.entry_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }

    fn insert(&self, key: &str, value: String, ttl: Option<Duration>) {
        let entry = CacheEntry::new(value, ttl.or(self.default_ttl));
        self.write_disk(key, &entry);
        if let Ok(mut memory) = self.memory.write() {
            memory.insert(key.to_string(), entry);
        }
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

impl CacheStore for TranslationCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now().timestamp();

        let memory_entry = self
            .memory
            .read()
            .ok()
            .and_then(|memory| memory.get(key).cloned());
        if let Some(entry) = memory_entry {
            if entry.expired(now) {
                if let Ok(mut memory) = self.memory.write() {
                    memory.remove(key);
                }
                self.remove_disk(key);
                self.miss();
                return None;
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value);
        }

        if let Some(entry) = self.read_disk(key) {
            if entry.expired(now) {
                self.remove_disk(key);
                self.miss();
                return None;
            }
            // Promote into the memory tier
            if let Ok(mut memory) = self.memory.write() {
                memory.insert(key.to_string(), entry.clone());
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value);
        }

        self.miss();
        None
    }

    fn set(&self, key: &str, value: String) {
        self.insert(key, value, None);
    }

    fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) {
        self.insert(key, value, Some(ttl));
    }

    fn delete(&self, key: &str) {
        if let Ok(mut memory) = self.memory.write() {
            memory.remove(key);
        }
        self.remove_disk(key);
    }

    fn clear(&self) {
        if let Ok(mut memory) = self.memory.write() {
            memory.clear();
        }
        if let Some(dir) = self.disk_dir.as_deref() {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for file in entries.flatten() {
                    if file.path().extension().is_some_and(|ext| ext == "cache") {
                        let _ = std::fs::remove_file(file.path());
                    }
                }
            }
        }
    }

    fn stats(&self) -> CacheStats {
        let entries = self
            .memory
            .read()
            .map(|memory| memory.len() as u64)
            .unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_shape() {
        let fp = step_fingerprint(
            "initial", "openai", "gpt-4o", "English", "Chinese", 0.3, 2048, "Hello", None,
        );
        assert_eq!(
            fp,
            "step:initial|provider:openai|model:gpt-4o|src:English|tgt:Chinese|temp:0.30|tokens:2048|text:Hello"
        );
        let fp = step_fingerprint(
            "reflection", "openai", "gpt-4o", "en", "zh", 0.3, 2048, "Hello", Some("你好"),
        );
        assert!(fp.ends_with("|text:Hello|context:你好"));
    }

    #[test]
    fn test_cache_key_is_lowercase_md5_hex() {
        let key = cache_key("abc");
        // MD5("abc")
        assert_eq!(key, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let base = step_fingerprint("s", "p", "m", "en", "zh", 0.3, 100, "t", None);
        let temp = step_fingerprint("s", "p", "m", "en", "zh", 0.31, 100, "t", None);
        let model = step_fingerprint("s", "p", "m2", "en", "zh", 0.3, 100, "t", None);
        assert_ne!(cache_key(&base), cache_key(&temp));
        assert_ne!(cache_key(&base), cache_key(&model));
    }

    #[test]
    fn test_memory_set_get() {
        let cache = TranslationCache::memory();
        assert_eq!(cache.get("k"), None);
        cache.set("k", "v".into());
        assert_eq!(cache.get("k"), Some("v".into()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = TranslationCache::memory();
        cache.set("a", "1".into());
        cache.set("b", "2".into());
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some("2".into()));
        cache.clear();
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_ttl_expiry_is_miss() {
        let cache = TranslationCache::memory();
        cache.set_with_ttl("k", "v".into(), Duration::ZERO);
        // A zero TTL entry written "now" is not yet expired within the same
        // second, so backdate it.
        if let Ok(mut memory) = cache.memory.write() {
            if let Some(entry) = memory.get_mut("k") {
                entry.timestamp -= 10;
            }
        }
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_unexpired_ttl_entry_hits() {
        let cache = TranslationCache::memory();
        cache.set_with_ttl("k", "v".into(), Duration::from_secs(3600));
        assert_eq!(cache.get("k"), Some("v".into()));
    }

    #[test]
    fn test_disk_tier_roundtrip_and_promotion() {
        let dir = TempDir::new().unwrap();
        let key = cache_key("fingerprint");
        {
            let cache = TranslationCache::with_disk(dir.path());
            cache.set(&key, "persisted".into());
            assert!(dir.path().join(format!("{key}.cache")).exists());
        }
        // Fresh instance: memory tier empty, disk tier must serve and promote
        let cache = TranslationCache::with_disk(dir.path());
        assert_eq!(cache.get(&key), Some("persisted".into()));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_disk_entry_is_json() {
        let dir = TempDir::new().unwrap();
        let cache = TranslationCache::with_disk(dir.path());
        cache.set_with_ttl("deadbeef", "value".into(), Duration::from_secs(60));
        let bytes = std::fs::read(dir.path().join("deadbeef.cache")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["value"], "value");
        assert!(json["timestamp"].is_i64());
        assert_eq!(json["ttl"], 60);
    }

    #[test]
    fn test_corrupt_disk_entry_treated_as_miss() {
        let dir = TempDir::new().unwrap();
        let cache = TranslationCache::with_disk(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.cache"), b"not json").unwrap();
        assert_eq!(cache.get("bad"), None);
        assert!(!dir.path().join("bad.cache").exists());
    }

    #[test]
    fn test_unwritable_disk_falls_back_to_memory() {
        let file = TempDir::new().unwrap();
        // Point the disk tier at a path that cannot become a directory
        let blocked = file.path().join("occupied");
        std::fs::write(&blocked, b"file").unwrap();
        let cache = TranslationCache::with_disk(blocked.join("sub"));
        cache.set("k", "v".into());
        assert_eq!(cache.get("k"), Some("v".into()));
    }

    #[test]
    fn test_clear_wipes_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = TranslationCache::with_disk(dir.path());
        cache.set("aa", "1".into());
        cache.set("bb", "2".into());
        cache.clear();
        assert_eq!(cache.get("aa"), None);
        assert!(!dir.path().join("aa.cache").exists());
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        let cache = Arc::new(TranslationCache::memory());
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("k{}", i % 10);
                    cache.set(&key, format!("v{t}-{i}"));
                    let _ = cache.get(&key);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().entries, 10);
    }
}
