//! Single-load guarantees of the index cache under concurrent queries.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use modsim::{IndexCache, IndexError, IndexStore, SimilarityEngine};
use tempfile::TempDir;

use crate::common::{CountingSource, HashEmbedder, five_known_records, publish_records};

const THREADS: usize = 16;

fn counting_engine(dir: &TempDir, delay: Duration) -> (Arc<CountingSource>, SimilarityEngine) {
    let store = IndexStore::new(dir.path());
    let source = Arc::new(CountingSource::new(store, delay));
    let cache = Arc::new(IndexCache::new(source.clone()));
    let engine = SimilarityEngine::new(cache, Arc::new(HashEmbedder::new(4)));
    (source, engine)
}

#[test]
fn cached_subreddit_is_never_reloaded() {
    let dir = TempDir::new().unwrap();
    let (source, engine) = counting_engine(&dir, Duration::ZERO);
    publish_records(&source.store, "rust", &five_known_records());

    for _ in 0..25 {
        engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 3, 2).unwrap();
    }

    assert_eq!(source.loads(), 1);
    assert_eq!(engine.cache().loads_performed(), 1);
}

#[test]
fn simultaneous_first_queries_load_once() {
    let dir = TempDir::new().unwrap();
    let (source, engine) = counting_engine(&dir, Duration::from_millis(100));
    publish_records(&source.store, "rust", &five_known_records());

    let barrier = Barrier::new(THREADS);
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    engine.query("rust", &[0.0, 1.0, 0.0, 0.0], 2, 5)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(source.loads(), 1);
    for result in results {
        let result = result.unwrap();
        assert_eq!(result.neighbors[0].document_id, "doc_b");
    }
}

#[test]
fn all_waiters_share_one_entry() {
    let dir = TempDir::new().unwrap();
    let store = IndexStore::new(dir.path());
    publish_records(&store, "rust", &five_known_records());
    let source = Arc::new(CountingSource::new(store, Duration::from_millis(50)));
    let cache = IndexCache::new(source.clone());

    let barrier = Barrier::new(THREADS);
    let entries: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    cache.get("rust").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for entry in &entries[1..] {
        assert!(Arc::ptr_eq(&entries[0], entry));
    }
    assert_eq!(source.loads(), 1);
}

#[test]
fn different_subreddits_load_independently() {
    let dir = TempDir::new().unwrap();
    let (source, engine) = counting_engine(&dir, Duration::from_millis(20));
    for name in ["rust", "golang", "python"] {
        publish_records(&source.store, name, &five_known_records());
    }

    thread::scope(|scope| {
        for name in ["rust", "golang", "python", "rust", "golang", "python"] {
            let engine = &engine;
            scope.spawn(move || engine.query(name, &[0.0, 0.0, 1.0, 0.0], 1, 1).unwrap());
        }
    });

    assert_eq!(source.loads(), 3);
    assert_eq!(
        engine.cache().cached_subreddits(),
        vec!["golang", "python", "rust"]
    );
}

#[test]
fn failed_loads_are_retried_on_next_query() {
    let dir = TempDir::new().unwrap();
    let (source, engine) = counting_engine(&dir, Duration::ZERO);

    for _ in 0..3 {
        assert!(matches!(
            engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 1, 1),
            Err(IndexError::SubredditNotIndexed { .. })
        ));
    }
    assert_eq!(source.loads(), 3);

    publish_records(&source.store, "rust", &five_known_records());
    engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 1, 1).unwrap();
    engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 1, 1).unwrap();
    assert_eq!(source.loads(), 4);
}

#[test]
fn evicted_entry_stays_valid_for_holders() {
    let dir = TempDir::new().unwrap();
    let (source, engine) = counting_engine(&dir, Duration::ZERO);
    publish_records(&source.store, "rust", &five_known_records());

    let held = engine.cache().get("rust").unwrap();
    assert!(engine.cache().evict("rust"));

    let hits = held.index.search(&[1.0, 0.0, 0.0, 0.0], 1, 1).unwrap();
    assert_eq!(held.ids.resolve(hits[0].position), Some("doc_a"));

    engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 1, 1).unwrap();
    assert_eq!(source.loads(), 2);
}
