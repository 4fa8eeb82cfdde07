//! Post dump to published index to scored post.

use std::io::Write;
use std::sync::Arc;

use modsim::posts::{group_by_subreddit, read_posts_jsonl};
use modsim::{
    IndexBuilder, IndexError, PostSimilarityRequest, Publisher, RawPost, SubredditFitRequest,
};

use crate::common::{FlakyEmbedder, HashEmbedder, TestEnv, post};

const DIM: usize = 64;

const DUMP: &str = r#"
{"submission_id": "r1", "submission_title": "Borrow checker rejects my closure", "submission_text": "lifetime of captured reference", "subreddit": "rust"}
{"submission_id": "c1", "submission_title": "Sourdough starter smells sour", "submission_text": "flour water ratio", "subreddit": "cooking"}
{"id": "r2", "title": "Async trait objects and pinning", "selftext": "tokio futures boxed", "subreddit": "rust"}

{"submission_id": "c2", "submission_title": "Cast iron seasoning flaking", "submission_text": "oil oven temperature", "subreddit": "cooking"}
{"submission_id": "r3", "submission_title": "Cargo workspace feature unification", "submission_text": "dependency resolver", "subreddit": "rust"}
{"submission_id": "c3", "submission_title": "Braising short ribs overnight", "submission_text": "wine stock carrots", "subreddit": "cooking"}
{"submission_id": "r4", "submission_title": "Generic associated types stabilised", "subreddit": "rust"}
"#;

fn publish_dump(env: &TestEnv, embedder: &HashEmbedder) -> Vec<(String, Vec<RawPost>)> {
    let mut file = tempfile::NamedTempFile::new_in(env.dir.path()).unwrap();
    file.write_all(DUMP.as_bytes()).unwrap();

    let posts = read_posts_jsonl(file.path()).unwrap();
    assert_eq!(posts.len(), 7);
    let groups = group_by_subreddit(posts, &[]);

    let builder = IndexBuilder::new();
    let publisher = Publisher::new(&builder, embedder, &env.store)
        .with_cache(env.engine.cache())
        .with_batch_size(2);
    for (subreddit, posts) in &groups {
        let mut progress = Vec::new();
        let report = publisher
            .publish(subreddit, posts, |done| progress.push(done))
            .unwrap();
        assert_eq!(report.documents, posts.len());
        assert_eq!(progress.last(), Some(&posts.len()));
    }
    groups
}

#[test]
fn dump_groups_by_first_appearance() {
    let embedder = HashEmbedder::new(DIM);
    let env = TestEnv::new(Arc::new(HashEmbedder::new(DIM)));
    let groups = publish_dump(&env, &embedder);

    let names: Vec<&str> = groups.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["rust", "cooking"]);
    assert_eq!(groups[0].1[1].submission_id, "r2");
    assert_eq!(env.store.list().unwrap(), vec!["cooking", "rust"]);
}

#[test]
fn known_post_is_its_own_nearest_neighbor() {
    let embedder = HashEmbedder::new(DIM);
    let env = TestEnv::new(Arc::new(HashEmbedder::new(DIM)));
    publish_dump(&env, &embedder);

    let request = PostSimilarityRequest {
        post_title: "Cargo workspace feature unification".to_string(),
        post_text: "dependency resolver".to_string(),
        subreddit: "rust".to_string(),
        k: 3,
        search_breadth: 10,
    };
    let result = env.engine.query_post(&request).unwrap();

    assert_eq!(result.neighbors[0].document_id, "r3");
    assert!(result.neighbors[0].distance.abs() < 1e-5);
    assert_eq!(result.neighbors.len(), 3);
}

#[test]
fn republishing_evicts_the_cached_index() {
    let embedder = HashEmbedder::new(DIM);
    let env = TestEnv::new(Arc::new(HashEmbedder::new(DIM)));
    publish_dump(&env, &embedder);

    let request = PostSimilarityRequest {
        post_title: "Lock free queue in unsafe code".to_string(),
        post_text: String::new(),
        subreddit: "rust".to_string(),
        k: 1,
        search_breadth: 10,
    };
    let before = env.engine.query_post(&request).unwrap();
    assert_ne!(before.neighbors[0].document_id, "r5");
    assert!(env.engine.cache().peek("rust").is_some());

    let builder = IndexBuilder::new();
    let posts = vec![
        post("r1", "rust", "Borrow checker rejects my closure", ""),
        post("r5", "rust", "Lock free queue in unsafe code", ""),
    ];
    Publisher::new(&builder, &embedder, &env.store)
        .with_cache(env.engine.cache())
        .publish("rust", &posts, |_| {})
        .unwrap();
    assert!(env.engine.cache().peek("rust").is_none());

    let after = env.engine.query_post(&request).unwrap();
    assert_eq!(after.neighbors[0].document_id, "r5");
    assert!((after.similarity_score - 1.0).abs() < 1e-5);
}

#[test]
fn fit_ranks_the_matching_subreddit_first() {
    let embedder = HashEmbedder::new(DIM);
    let env = TestEnv::new(Arc::new(HashEmbedder::new(DIM)));
    publish_dump(&env, &embedder);

    let request = SubredditFitRequest {
        post_title: "Async trait objects and pinning".to_string(),
        post_text: "tokio futures boxed".to_string(),
        subreddits: vec![
            "missing".to_string(),
            "cooking".to_string(),
            "rust".to_string(),
            "cooking".to_string(),
        ],
        k: 1,
        search_breadth: 10,
    };
    let fits = env.engine.fit(&request).unwrap();

    let names: Vec<&str> = fits.iter().map(|f| f.subreddit.as_str()).collect();
    assert_eq!(names, vec!["rust", "cooking", "missing"]);

    let rust = fits[0].result.as_ref().unwrap();
    let cooking = fits[1].result.as_ref().unwrap();
    assert!(rust.similarity_score > cooking.similarity_score);
    assert!(matches!(
        fits[2].result,
        Err(IndexError::SubredditNotIndexed { .. })
    ));
}

#[test]
fn batch_scoring_isolates_embedding_failures() {
    let env = TestEnv::new(Arc::new(FlakyEmbedder::new(DIM)));
    let history = vec![
        post("r1", "rust", "Borrow checker rejects my closure", "lifetimes"),
        post("r2", "rust", "Async trait objects and pinning", "futures"),
        post("r3", "rust", "Cargo workspace feature unification", "resolver"),
    ];
    let builder = IndexBuilder::new();
    let embedder = FlakyEmbedder::new(DIM);
    Publisher::new(&builder, &embedder, &env.store)
        .publish("rust", &history, |_| {})
        .unwrap();

    let incoming = vec![
        post("n1", "rust", "Closure borrow question", ""),
        post("n2", "rust", "FAIL this one", ""),
        post("n3", "rust", "Workspace features", ""),
    ];
    let scores = env.engine.score_posts("rust", &incoming, 2, 10).unwrap();

    let ids: Vec<&str> = scores.iter().map(|s| s.submission_id.as_str()).collect();
    assert_eq!(ids, vec!["n1", "n2", "n3"]);
    assert!(scores[0].result.is_ok());
    assert!(matches!(scores[1].result, Err(IndexError::Embedding(_))));
    assert_eq!(scores[2].result.as_ref().unwrap().neighbors.len(), 2);
}

#[test]
fn batch_scoring_unindexed_subreddit_fails_whole() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(DIM)));
    let incoming = vec![post("n1", "rust", "anything", "")];

    let err = env.engine.score_posts("rust", &incoming, 2, 2).unwrap_err();
    assert!(matches!(err, IndexError::SubredditNotIndexed { .. }));
}

#[test]
fn malformed_dump_line_is_reported_with_its_number() {
    let env = TestEnv::new(Arc::new(HashEmbedder::new(DIM)));
    let mut file = tempfile::NamedTempFile::new_in(env.dir.path()).unwrap();
    writeln!(file, r#"{{"submission_id": "r1", "subreddit": "rust"}}"#).unwrap();
    writeln!(file, "not json").unwrap();

    let err = read_posts_jsonl(file.path()).unwrap_err();
    assert_eq!(err.status_code(), "INVALID_INPUT");
    assert!(err.to_string().contains(":2:"));
}
