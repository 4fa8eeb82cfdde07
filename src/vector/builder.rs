//! Offline construction of a subreddit's IVF-Flat index and id table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IndexError, IndexResult};
use crate::vector::clustering::{DEFAULT_MAX_ITERATIONS, KMeansConfig};
use crate::vector::embedding::{Embedder, post_text};
use crate::vector::ivf::IvfFlatIndex;
use crate::vector::types::{DocumentRecord, IdTable, VectorDimension, validate_subreddit};

/// Upper bound on the number of inverted lists per index.
pub const DEFAULT_MAX_LISTS: usize = 100;

/// Seed for k-means++ initialisation; fixed so rebuilds are reproducible.
pub const DEFAULT_SEED: u64 = 42;

/// How a build treats a `document_id` that appears more than once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Fail the build with `IndexError::DuplicateDocument`.
    #[default]
    Reject,
    /// The later record replaces the earlier one. Survivors keep the input
    /// order of their first occurrence.
    LastWriteWins,
}

/// A trained, filled index and its aligned id table.
#[derive(Debug, Clone)]
pub struct BuiltIndex {
    pub index: IvfFlatIndex,
    pub ids: IdTable,
}

/// Builds IVF-Flat indexes from batches of document embeddings.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    max_lists: usize,
    nlist: Option<usize>,
    max_iterations: usize,
    seed: u64,
    duplicate_policy: DuplicatePolicy,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            max_lists: DEFAULT_MAX_LISTS,
            nlist: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            seed: DEFAULT_SEED,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    pub fn with_max_lists(mut self, max_lists: usize) -> Self {
        self.max_lists = max_lists.max(1);
        self
    }

    /// Forces a list count instead of `min(max_lists, corpus)`. Still clamped
    /// to the corpus size. Useful to retry a build that failed training.
    pub fn with_nlist(mut self, nlist: usize) -> Self {
        self.nlist = Some(nlist.max(1));
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// List count used for a corpus of `corpus_size` documents.
    #[must_use]
    pub fn nlist_for(&self, corpus_size: usize) -> usize {
        self.nlist
            .unwrap_or(self.max_lists)
            .min(corpus_size)
            .max(1)
    }

    /// Trains an index on `records` and adds every embedding in input order.
    ///
    /// The returned id table satisfies `ids.len() == index.vector_count()`,
    /// with position `i` naming the i-th surviving record.
    ///
    /// # Errors
    /// - `InvalidSubreddit` for names unusable as store keys
    /// - `InvalidInput` for an empty batch, mixed dimensions or non-finite values
    /// - `DuplicateDocument` under [`DuplicatePolicy::Reject`]
    /// - `Training` when clustering cannot produce `nlist` clusters
    pub fn build(&self, subreddit: &str, records: &[DocumentRecord]) -> IndexResult<BuiltIndex> {
        validate_subreddit(subreddit)?;

        let first = records.first().ok_or_else(|| IndexError::InvalidInput {
            reason: format!("no documents to index for r/{subreddit}"),
        })?;
        let dimension = VectorDimension::new(first.embedding.len())?;

        for (i, record) in records.iter().enumerate() {
            if record.embedding.len() != dimension.get() {
                return Err(IndexError::InvalidInput {
                    reason: format!(
                        "document '{}' at position {i} has dimension {}, expected {}",
                        record.document_id,
                        record.embedding.len(),
                        dimension.get()
                    ),
                });
            }
            if record.embedding.iter().any(|v| !v.is_finite()) {
                return Err(IndexError::InvalidInput {
                    reason: format!(
                        "document '{}' has a NaN or infinite component",
                        record.document_id
                    ),
                });
            }
        }

        let records = self.apply_duplicate_policy(records)?;
        let vectors: Vec<&[f32]> = records.iter().map(|r| r.embedding.as_slice()).collect();

        let nlist = self.nlist_for(vectors.len());
        let config = KMeansConfig {
            k: nlist,
            max_iterations: self.max_iterations,
            seed: self.seed,
        };

        info!(
            subreddit,
            documents = vectors.len(),
            dimension = dimension.get(),
            nlist,
            "training index"
        );

        let mut index = IvfFlatIndex::train(dimension, &vectors, &config).map_err(|source| {
            IndexError::Training {
                subreddit: subreddit.to_string(),
                source,
            }
        })?;
        index.add(&vectors)?;

        let ids = IdTable::new(records.iter().map(|r| r.document_id.clone()).collect());
        debug_assert_eq!(ids.len(), index.vector_count());

        debug!(subreddit, list_sizes = ?index.list_sizes(), "index built");
        Ok(BuiltIndex { index, ids })
    }

    /// Embeds posts through `embedder` in batches of `batch_size`, then builds.
    ///
    /// `on_batch` is called with the number of posts embedded so far.
    pub fn build_from_posts(
        &self,
        embedder: &dyn Embedder,
        subreddit: &str,
        posts: &[crate::posts::RawPost],
        batch_size: usize,
        mut on_batch: impl FnMut(usize),
    ) -> IndexResult<BuiltIndex> {
        validate_subreddit(subreddit)?;

        let batch_size = batch_size.max(1);
        let mut records = Vec::with_capacity(posts.len());
        for chunk in posts.chunks(batch_size) {
            let texts: Vec<String> = chunk
                .iter()
                .map(|p| post_text(&p.submission_title, &p.submission_text))
                .collect();
            let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let embeddings = embedder.embed_batch(&text_refs)?;

            records.extend(
                chunk
                    .iter()
                    .zip(embeddings)
                    .map(|(post, embedding)| {
                        DocumentRecord::new(post.submission_id.clone(), embedding)
                    }),
            );
            on_batch(records.len());
        }

        self.build(subreddit, &records)
    }

    fn apply_duplicate_policy<'a>(
        &self,
        records: &'a [DocumentRecord],
    ) -> IndexResult<Vec<&'a DocumentRecord>> {
        let mut first_seen: HashMap<&str, usize> = HashMap::with_capacity(records.len());
        let mut kept: Vec<&DocumentRecord> = Vec::with_capacity(records.len());

        for (i, record) in records.iter().enumerate() {
            match first_seen.get(record.document_id.as_str()) {
                None => {
                    first_seen.insert(record.document_id.as_str(), kept.len());
                    kept.push(record);
                }
                Some(&slot) => match self.duplicate_policy {
                    DuplicatePolicy::Reject => {
                        let first = records
                            .iter()
                            .position(|r| r.document_id == record.document_id)
                            .unwrap_or(slot);
                        return Err(IndexError::DuplicateDocument {
                            document_id: record.document_id.clone(),
                            first,
                            second: i,
                        });
                    }
                    DuplicatePolicy::LastWriteWins => {
                        warn!(
                            document_id = %record.document_id,
                            position = i,
                            "duplicate document id, keeping the later record"
                        );
                        kept[slot] = record;
                    }
                },
            }
        }

        Ok(kept)
    }
}
