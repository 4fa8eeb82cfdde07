//! Similarity query engine.
//!
//! Ties the index cache to an embedder: embeds an incoming post, searches the
//! subreddit's index and turns the neighbor distances into one score.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{IndexError, IndexResult};
use crate::posts::{PostSimilarityRequest, RawPost, SubredditFitRequest};
use crate::vector::cache::{CacheEntry, IndexCache};
use crate::vector::embedding::{Embedder, post_text};
use crate::vector::types::{Neighbor, SimilarityResult};

/// Similarity of one neighbor at squared L2 distance `distance`.
#[must_use]
pub fn neighbor_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Harmonic mean of the per-neighbor similarities: `n / Σ(1 + dᵢ)`.
///
/// Dominated by the weakest matches, so one close duplicate among unrelated
/// posts scores lower than consistently close neighbors. Zero for no
/// neighbors.
#[must_use]
pub fn harmonic_similarity(distances: &[f32]) -> f32 {
    if distances.is_empty() {
        return 0.0;
    }
    let denominator: f32 = distances.iter().map(|d| 1.0 + d).sum();
    distances.len() as f32 / denominator
}

/// Score of one subreddit in a multi-subreddit fit.
#[derive(Debug)]
pub struct SubredditFit {
    pub subreddit: String,
    pub result: IndexResult<SimilarityResult>,
}

/// Score of one post in a batch.
#[derive(Debug)]
pub struct PostScore {
    pub submission_id: String,
    pub result: IndexResult<SimilarityResult>,
}

/// Answers similarity queries against cached subreddit indexes.
#[derive(Clone)]
pub struct SimilarityEngine {
    cache: Arc<IndexCache>,
    embedder: Arc<dyn Embedder>,
}

impl std::fmt::Debug for SimilarityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityEngine")
            .field("cache", &self.cache)
            .field("dimension", &self.embedder.dimension())
            .finish()
    }
}

impl SimilarityEngine {
    pub fn new(cache: Arc<IndexCache>, embedder: Arc<dyn Embedder>) -> Self {
        Self { cache, embedder }
    }

    pub fn cache(&self) -> &Arc<IndexCache> {
        &self.cache
    }

    /// Finds the `k` nearest historical posts of `subreddit` and scores them.
    ///
    /// # Errors
    /// - `InvalidInput` when `k` or `search_breadth` is zero, or the query
    ///   has a NaN or infinite component
    /// - `SubredditNotIndexed` when the subreddit has no stored index
    /// - `DimensionMismatch` when the query does not match the index
    pub fn query(
        &self,
        subreddit: &str,
        query_embedding: &[f32],
        k: usize,
        search_breadth: usize,
    ) -> IndexResult<SimilarityResult> {
        if k == 0 {
            return Err(IndexError::InvalidInput {
                reason: "k must be at least 1".to_string(),
            });
        }
        if search_breadth == 0 {
            return Err(IndexError::InvalidInput {
                reason: "search_breadth must be at least 1".to_string(),
            });
        }

        let entry = self.indexed(subreddit)?;
        entry.index.dimension().validate_vector(query_embedding)?;

        let hits = entry.index.search(query_embedding, k, search_breadth)?;

        let mut neighbors = Vec::with_capacity(hits.len());
        for hit in hits {
            match entry.ids.resolve(hit.position) {
                Some(document_id) => neighbors.push(Neighbor {
                    document_id: document_id.to_string(),
                    distance: hit.distance,
                    similarity: neighbor_similarity(hit.distance),
                }),
                None => warn!(
                    subreddit,
                    position = hit.position,
                    "search hit outside the id table, skipping"
                ),
            }
        }

        let result = summarize(subreddit, neighbors);
        debug!(
            subreddit,
            k,
            search_breadth,
            neighbors = result.neighbors.len(),
            score = result.similarity_score,
            "similarity query"
        );
        Ok(result)
    }

    /// Embeds a post and queries its subreddit.
    pub fn query_post(&self, request: &PostSimilarityRequest) -> IndexResult<SimilarityResult> {
        let embedding = self
            .embedder
            .embed(&post_text(&request.post_title, &request.post_text))?;
        self.query(&request.subreddit, &embedding, request.k, request.search_breadth)
    }

    /// Scores one post against several subreddits, best fit first.
    ///
    /// The post is embedded once. Each subreddit keeps its own outcome;
    /// failures sort after every successful score, in request order.
    pub fn fit(&self, request: &SubredditFitRequest) -> IndexResult<Vec<SubredditFit>> {
        let embedding = self
            .embedder
            .embed(&post_text(&request.post_title, &request.post_text))?;

        let mut seen = std::collections::HashSet::new();
        let mut fits: Vec<SubredditFit> = request
            .subreddits
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .map(|name| SubredditFit {
                subreddit: name.clone(),
                result: self.query(name, &embedding, request.k, request.search_breadth),
            })
            .collect();

        fits.sort_by(|a, b| match (&a.result, &b.result) {
            (Ok(x), Ok(y)) => y.similarity_score.total_cmp(&x.similarity_score),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => std::cmp::Ordering::Equal,
        });
        Ok(fits)
    }

    /// Scores a batch of posts against one subreddit.
    ///
    /// Fails as a whole only when the subreddit cannot be served. A post
    /// whose embedding fails gets its own error.
    pub fn score_posts(
        &self,
        subreddit: &str,
        posts: &[RawPost],
        k: usize,
        search_breadth: usize,
    ) -> IndexResult<Vec<PostScore>> {
        self.indexed(subreddit)?;

        let texts: Vec<String> = posts
            .iter()
            .map(|p| post_text(&p.submission_title, &p.submission_text))
            .collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        let embeddings: Vec<IndexResult<Vec<f32>>> = match self.embedder.embed_batch(&text_refs) {
            Ok(batch) => batch.into_iter().map(Ok).collect(),
            Err(e) => {
                warn!(error = %e, "batch embedding failed, embedding posts one by one");
                text_refs.iter().map(|t| self.embedder.embed(t)).collect()
            }
        };

        Ok(posts
            .iter()
            .zip(embeddings)
            .map(|(post, embedding)| PostScore {
                submission_id: post.submission_id.clone(),
                result: embedding
                    .and_then(|e| self.query(subreddit, &e, k, search_breadth)),
            })
            .collect())
    }

    fn indexed(&self, subreddit: &str) -> IndexResult<Arc<CacheEntry>> {
        self.cache.get(subreddit).map_err(|e| match e {
            IndexError::NotFound { subreddit, .. } => IndexError::SubredditNotIndexed { subreddit },
            other => other,
        })
    }
}

fn summarize(subreddit: &str, neighbors: Vec<Neighbor>) -> SimilarityResult {
    let distances: Vec<f32> = neighbors.iter().map(|n| n.distance).collect();
    let (avg_distance, min_distance, max_distance) = if distances.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let sum: f32 = distances.iter().sum();
        (
            sum / distances.len() as f32,
            distances.iter().copied().fold(f32::INFINITY, f32::min),
            distances.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        )
    };

    SimilarityResult {
        subreddit: subreddit.to_string(),
        similarity_score: harmonic_similarity(&distances),
        avg_distance,
        min_distance,
        max_distance,
        neighbors,
    }
}
