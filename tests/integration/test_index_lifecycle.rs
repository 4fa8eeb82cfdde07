//! Build, persist, load and query a subreddit index end to end.

use std::sync::Arc;

use modsim::vector::IvfFlatIndex;
use modsim::{DocumentRecord, IndexBuilder, IndexError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{HashEmbedder, TestEnv, five_known_records, publish_records};

fn random_records(n: usize, dim: usize, seed: u64) -> Vec<DocumentRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let v: Vec<f32> = (0..dim).map(|_| rng.random::<f32>()).collect();
            DocumentRecord::new(format!("t3_{i:05}"), v)
        })
        .collect()
}

#[test]
fn id_table_matches_vector_count_for_every_corpus_size() {
    for n in [1, 2, 7, 99, 100, 101, 250] {
        let records = random_records(n, 8, n as u64);
        let built = IndexBuilder::new().build("rust", &records).unwrap();

        assert_eq!(built.ids.len(), built.index.vector_count(), "n = {n}");
        assert_eq!(built.index.vector_count(), n);
        assert_eq!(built.index.nlist(), n.min(100));
        for (i, record) in records.iter().enumerate() {
            assert_eq!(built.ids.resolve(i as u32), Some(record.document_id.as_str()));
        }
    }
}

#[test]
fn saved_index_answers_queries_bit_identically() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(16)));
    let records = random_records(300, 16, 7);
    let built = IndexBuilder::new().build("rust", &records).unwrap();
    env.store.save("rust", &built.index, &built.ids).unwrap();

    let loaded = env.store.load("rust").unwrap();
    assert_eq!(loaded.ids, built.ids);

    let queries = random_records(20, 16, 99);
    for query in &queries {
        for nprobe in [1, 2, 10, 100] {
            let before = built.index.search(&query.embedding, 10, nprobe).unwrap();
            let after = loaded.index.search(&query.embedding, 10, nprobe).unwrap();
            assert_eq!(before.len(), after.len());
            for (a, b) in before.iter().zip(&after) {
                assert_eq!(a.position, b.position);
                assert_eq!(a.distance.to_bits(), b.distance.to_bits());
            }
        }
    }
}

#[test]
fn engine_query_on_loaded_index_matches_in_memory_search() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(16)));
    let records = random_records(120, 16, 3);
    let built = IndexBuilder::new().build("rust", &records).unwrap();
    env.store.save("rust", &built.index, &built.ids).unwrap();

    let query = &records[17].embedding;
    let result = env.engine.query("rust", query, 5, 4).unwrap();
    let direct = built.index.search(query, 5, 4).unwrap();

    let ids: Vec<&str> = result.neighbors.iter().map(|n| n.document_id.as_str()).collect();
    let expected: Vec<&str> = direct
        .iter()
        .map(|h| built.ids.resolve(h.position).unwrap())
        .collect();
    assert_eq!(ids, expected);
    assert_eq!(ids[0], "t3_00017");
}

#[test]
fn known_embedding_finds_itself_first() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    let records = five_known_records();
    publish_records(&env.store, "rust", &records);

    let result = env
        .engine
        .query("rust", &records[2].embedding, 3, 2)
        .unwrap();

    let top = &result.neighbors[0];
    assert_eq!(top.document_id, "doc_c");
    assert!(top.distance.abs() < 1e-6);
    assert!((top.similarity - 1.0).abs() < 1e-6);
    assert!(result.min_distance.abs() < 1e-6);
    for pair in result.neighbors.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
}

#[test]
fn small_corpus_returns_every_document() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    let records = &five_known_records()[..3];
    publish_records(&env.store, "tiny", records);

    let result = env
        .engine
        .query("tiny", &[0.5, 0.5, 0.0, 0.0], 10, 10)
        .unwrap();

    assert_eq!(result.neighbors.len(), 3);
    let n = result.neighbors.len() as f32;
    let sum: f32 = result.neighbors.iter().map(|nb| 1.0 + nb.distance).sum();
    assert!((result.similarity_score - n / sum).abs() < 1e-6);
}

#[test]
fn unindexed_subreddit_is_reported_as_such() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));

    let err = env
        .engine
        .query("never_built", &[0.0; 4], 10, 2)
        .unwrap_err();
    assert!(matches!(
        &err,
        IndexError::SubredditNotIndexed { subreddit } if subreddit == "never_built"
    ));
    assert!(err.is_recoverable_by_build());
    assert_eq!(env.engine.cache().loads_performed(), 1);
    assert!(env.engine.cache().is_empty());
}

#[test]
fn wrong_query_dimension_is_rejected() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    publish_records(&env.store, "rust", &five_known_records());

    let err = env.engine.query("rust", &[1.0, 0.0], 3, 2).unwrap_err();
    assert!(matches!(
        err,
        IndexError::DimensionMismatch {
            expected: 4,
            actual: 2
        }
    ));
}

#[test]
fn zero_k_or_breadth_is_invalid_input() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    publish_records(&env.store, "rust", &five_known_records());

    for (k, breadth) in [(0, 2), (3, 0)] {
        let err = env.engine.query("rust", &[1.0, 0.0, 0.0, 0.0], k, breadth).unwrap_err();
        assert_eq!(err.status_code(), "INVALID_INPUT");
    }
}

#[test]
fn non_finite_query_is_invalid_input() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    publish_records(&env.store, "rust", &five_known_records());

    for query in [[f32::NAN, 0.0, 0.0, 0.0], [0.0, f32::INFINITY, 0.0, 0.0]] {
        let err = env.engine.query("rust", &query, 3, 5).unwrap_err();
        assert!(matches!(err, IndexError::InvalidInput { .. }));
    }

    // Finite queries still score within [0, 1]
    let ok = env.engine.query("rust", &[0.5, 0.5, 0.0, 0.0], 3, 5).unwrap();
    assert!(ok.similarity_score > 0.0 && ok.similarity_score <= 1.0);
}

#[test]
fn rebuild_is_picked_up_after_refresh() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    publish_records(&env.store, "rust", &five_known_records()[..2]);

    let first = env.engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 10, 10).unwrap();
    assert_eq!(first.neighbors.len(), 2);

    publish_records(&env.store, "rust", &five_known_records());

    // Still served from the cached build until refreshed
    let cached = env.engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 10, 10).unwrap();
    assert_eq!(cached.neighbors.len(), 2);

    assert!(env.engine.cache().refresh("rust").unwrap());
    let fresh = env.engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 10, 10).unwrap();
    assert_eq!(fresh.neighbors.len(), 5);
}

#[test]
fn loaded_index_equals_built_index() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(8)));
    let records = random_records(64, 8, 11);
    let built = IndexBuilder::new().with_nlist(8).build("golang", &records).unwrap();
    env.store.save("golang", &built.index, &built.ids).unwrap();

    let loaded: IvfFlatIndex = env.store.load("golang").unwrap().index;
    assert_eq!(loaded, built.index);
    assert_eq!(env.store.list().unwrap(), vec!["golang"]);
}
