//! Exact-text embedding cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::{EmbedError, Embedder};

/// Vector shared between the cache and its readers.
pub type SharedEmbedding = Arc<[f32]>;

/// Caches embeddings by their exact source text.
///
/// Keys are case-sensitive and never normalized. Entries are never evicted,
/// so growth is bounded by the number of distinct texts seen by the process.
/// Failed upstream calls are not cached.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    entries: RwLock<HashMap<String, SharedEmbedding>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        Self {
            inner,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached vector for `text`, calling the upstream once on a miss.
    pub async fn embed(&self, text: &str) -> Result<SharedEmbedding, EmbedError> {
        if let Some(hit) = self.lookup(text) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let vector: SharedEmbedding = self.inner.embed(text).await?.into();

        // Concurrent misses on the same text all return the first stored vector.
        // A poisoned lock only loses the insert; the caller still gets its vector.
        match self.entries.write() {
            Ok(mut entries) => Ok(entries
                .entry(text.to_string())
                .or_insert(vector)
                .clone()),
            Err(_) => Ok(vector),
        }
    }

    /// Zero vector with the inner embedder's dimensionality.
    pub fn zero_vector(&self) -> SharedEmbedding {
        vec![0.0_f32; self.inner.dimensions()].into()
    }

    pub fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    pub fn model(&self) -> &str {
        self.inner.model()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().map(|e| e.len()).unwrap_or_default();
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, text: &str) -> Option<SharedEmbedding> {
        self.entries.read().ok()?.get(text).cloned()
    }
}
