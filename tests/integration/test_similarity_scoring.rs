//! Harmonic-mean scoring as seen through the query engine.

use std::sync::Arc;

use modsim::DocumentRecord;
use modsim::vector::harmonic_similarity;

use crate::common::{HashEmbedder, TestEnv, five_known_records, publish_records};

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-6
}

#[test]
fn uniform_distance_scores_its_own_similarity() {
    for d in [0.25f32, 1.0, 4.0, 99.0] {
        assert!(approx(harmonic_similarity(&[d, d, d]), 1.0 / (1.0 + d)));
    }
}

#[test]
fn equidistant_neighbors_report_uniform_statistics() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    publish_records(&env.store, "rust", &five_known_records());

    // The origin is at distance 1 from every axis vector and 2 from doc_e
    let result = env.engine.query("rust", &[0.0; 4], 4, 5).unwrap();

    let ids: Vec<&str> = result.neighbors.iter().map(|n| n.document_id.as_str()).collect();
    assert_eq!(ids, vec!["doc_a", "doc_b", "doc_c", "doc_d"]);
    assert!(approx(result.similarity_score, 0.5));
    assert!(approx(result.avg_distance, 1.0));
    assert!(approx(result.min_distance, 1.0));
    assert!(approx(result.max_distance, 1.0));
    for neighbor in &result.neighbors {
        assert!(approx(neighbor.similarity, 0.5));
    }
}

#[test]
fn result_statistics_follow_the_neighbors() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    publish_records(&env.store, "rust", &five_known_records());

    let result = env.engine.query("rust", &[1.0, 0.0, 0.0, 0.0], 5, 5).unwrap();
    let distances: Vec<f32> = result.neighbors.iter().map(|n| n.distance).collect();

    assert_eq!(distances.len(), 5);
    assert!(approx(result.similarity_score, harmonic_similarity(&distances)));
    assert!(approx(result.min_distance, 0.0));
    assert!(approx(result.max_distance, 2.0));
    assert!(approx(result.avg_distance, distances.iter().sum::<f32>() / 5.0));
    assert!(result.similarity_score > 0.0 && result.similarity_score <= 1.0);
}

#[test]
fn closer_corpus_scores_higher() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(2)));
    let near: Vec<DocumentRecord> = (0..6)
        .map(|i| DocumentRecord::new(format!("near_{i}"), vec![0.1 * i as f32, 0.0]))
        .collect();
    let far: Vec<DocumentRecord> = (0..6)
        .map(|i| DocumentRecord::new(format!("far_{i}"), vec![5.0 + 0.1 * i as f32, 5.0]))
        .collect();
    publish_records(&env.store, "near", &near);
    publish_records(&env.store, "far", &far);

    let query = [0.0, 0.0];
    let near_score = env.engine.query("near", &query, 3, 10).unwrap().similarity_score;
    let far_score = env.engine.query("far", &query, 3, 10).unwrap().similarity_score;
    assert!(near_score > far_score);
}

#[test]
fn scores_serialize_with_neighbor_details() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(4)));
    publish_records(&env.store, "rust", &five_known_records());

    let result = env.engine.query("rust", &[0.0, 1.0, 0.0, 0.0], 2, 5).unwrap();
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["subreddit"], "rust");
    assert_eq!(json["neighbors"][0]["document_id"], "doc_b");
    assert_eq!(json["neighbors"].as_array().unwrap().len(), 2);
}
