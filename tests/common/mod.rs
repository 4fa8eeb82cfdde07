#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use modsim::vector::{IndexSource, IndexStamp, StoredIndex, VectorDimension};
use modsim::{
    DocumentRecord, Embedder, IndexBuilder, IndexCache, IndexError, IndexResult, IndexStore,
    RawPost, SimilarityEngine,
};
use tempfile::TempDir;

/// Deterministic bag-of-words embedder: every lowercase token is hashed
/// into one of `dim` buckets and the counts are normalised to unit length.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in token.to_lowercase().bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            v[(hash % self.dim as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> IndexResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimension(&self) -> VectorDimension {
        VectorDimension::new(self.dim).unwrap()
    }
}

/// Fails any batch containing "FAIL", and single texts containing it.
pub struct FlakyEmbedder {
    inner: HashEmbedder,
}

impl FlakyEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dim),
        }
    }
}

impl Embedder for FlakyEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> IndexResult<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("FAIL")) {
            return Err(IndexError::Embedding("model rejected input".to_string()));
        }
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> VectorDimension {
        self.inner.dimension()
    }
}

/// Store wrapper that counts loads and makes each one slow, to widen the
/// window in which concurrent callers can collide.
pub struct CountingSource {
    pub store: IndexStore,
    loads: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    pub fn new(store: IndexStore, delay: Duration) -> Self {
        Self {
            store,
            loads: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl IndexSource for CountingSource {
    fn load(&self, subreddit: &str) -> IndexResult<StoredIndex> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.store.load(subreddit)
    }

    fn stamp(&self, subreddit: &str) -> IndexResult<IndexStamp> {
        self.store.stamp(subreddit)
    }
}

/// Five well-separated 4-d embeddings: the four axes and their first diagonal.
pub fn five_known_records() -> Vec<DocumentRecord> {
    vec![
        DocumentRecord::new("doc_a", vec![1.0, 0.0, 0.0, 0.0]),
        DocumentRecord::new("doc_b", vec![0.0, 1.0, 0.0, 0.0]),
        DocumentRecord::new("doc_c", vec![0.0, 0.0, 1.0, 0.0]),
        DocumentRecord::new("doc_d", vec![0.0, 0.0, 0.0, 1.0]),
        DocumentRecord::new("doc_e", vec![1.0, 1.0, 0.0, 0.0]),
    ]
}

/// Builds `records` for `subreddit` and saves them into `store`.
pub fn publish_records(store: &IndexStore, subreddit: &str, records: &[DocumentRecord]) {
    let built = IndexBuilder::new().build(subreddit, records).unwrap();
    store.save(subreddit, &built.index, &built.ids).unwrap();
}

pub fn post(id: &str, subreddit: &str, title: &str, body: &str) -> RawPost {
    RawPost {
        submission_id: id.to_string(),
        submission_title: title.to_string(),
        submission_text: body.to_string(),
        subreddit: subreddit.to_string(),
    }
}

/// A fresh index directory plus an engine reading from it.
pub struct TestEnv {
    pub dir: TempDir,
    pub store: IndexStore,
    pub engine: SimilarityEngine,
}

impl TestEnv {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = IndexStore::new(dir.path().join("indexes"));
        let cache = Arc::new(IndexCache::new(Arc::new(store.clone())));
        let engine = SimilarityEngine::new(cache, embedder);
        Self { dir, store, engine }
    }
}
