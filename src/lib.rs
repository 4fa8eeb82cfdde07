//! Per-subreddit similarity index engine for post moderation.
//!
//! Builds an IVF-Flat index over the embeddings of a subreddit's historical
//! posts, stores it on disk, caches it in memory on first use and scores new
//! posts by how close they sit to that history.

pub mod config;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod posts;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{IndexError, IndexResult};
pub use pipeline::{BuildReport, Publisher};
pub use posts::{PostSimilarityRequest, RawPost, SubredditFitRequest};
pub use vector::{
    DocumentRecord, Embedder, FastEmbedder, IdTable, IndexBuilder, IndexCache, IndexStore,
    SimilarityEngine, SimilarityResult,
};
