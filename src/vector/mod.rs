//! Per-subreddit similarity indexes.
//!
//! Historical posts of a subreddit are embedded and organised into an
//! IVF-Flat index (Inverted File with Flat vectors): k-means centroids act as
//! a coarse quantizer and every vector is stored uncompressed in the inverted
//! list of its nearest centroid. A query only scans the few lists closest to
//! it, which keeps search sub-linear in the corpus size.
//!
//! # Architecture
//! - [`IndexBuilder`] trains and fills an index offline
//! - [`IndexStore`] persists it next to its id table
//! - [`IndexCache`] loads each subreddit once per process
//! - [`SimilarityEngine`] embeds posts, searches and scores

mod builder;
mod cache;
mod clustering;
mod embedding;
mod engine;
mod ivf;
mod storage;
mod types;

// Re-export core types for public API
pub use builder::{BuiltIndex, DEFAULT_MAX_LISTS, DEFAULT_SEED, DuplicatePolicy, IndexBuilder};
pub use cache::{CacheEntry, IndexCache, IndexSource};
pub use clustering::{
    ClusteringError, DEFAULT_MAX_ITERATIONS, KMeansConfig, KMeansResult,
    assign_to_nearest_centroid, kmeans_clustering, squared_l2,
};
pub use embedding::{Embedder, FastEmbedder, parse_embedding_model, post_text};
pub use engine::{
    PostScore, SimilarityEngine, SubredditFit, harmonic_similarity, neighbor_similarity,
};
pub use ivf::{InvertedList, IvfFlatIndex};
pub use storage::{IndexHeader, IndexStamp, IndexStore, StoredIndex};
pub use types::{
    DocumentRecord, IdTable, ListId, Neighbor, SearchHit, SimilarityResult, VECTOR_DIMENSION_384,
    VectorDimension, validate_subreddit,
};
