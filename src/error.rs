//! Error types for the similarity index engine
//!
//! This module provides structured error types using thiserror so callers can
//! tell "this subreddit has not been indexed yet" apart from real faults.

use std::path::PathBuf;
use thiserror::Error;

use crate::vector::ClusteringError;

/// Main error type for building, persisting, caching and querying indexes
#[derive(Error, Debug)]
pub enum IndexError {
    /// Malformed build or query input
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error(
        "Duplicate document id '{document_id}' at positions {first} and {second}. Set build.duplicate_policy = \"last_write_wins\" to keep the later record"
    )]
    DuplicateDocument {
        document_id: String,
        first: usize,
        second: usize,
    },

    #[error("Invalid subreddit name '{name}': only ASCII letters, digits and '_' are allowed")]
    InvalidSubreddit { name: String },

    /// Clustering could not produce a usable coarse quantizer
    #[error("Index training failed for r/{subreddit}: {source}")]
    Training {
        subreddit: String,
        #[source]
        source: ClusteringError,
    },

    /// One or both artifacts of a subreddit are missing on disk
    #[error("No index stored for r/{subreddit} (looked for '{path}')")]
    NotFound { subreddit: String, path: PathBuf },

    /// Caller-facing form of `NotFound` raised by the query path
    #[error("Subreddit r/{subreddit} has not been indexed yet. Run 'modsim build' for it first")]
    SubredditNotIndexed { subreddit: String },

    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}. Ensure the index and the query use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index artifact '{path}' is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Embedding generation failed: {0}")]
    Embedding(String),
}

impl IndexError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } | Self::DuplicateDocument { .. } => "INVALID_INPUT",
            Self::InvalidSubreddit { .. } => "INVALID_INPUT",
            Self::Training { .. } => "INDEX_TRAINING_FAILED",
            Self::NotFound { .. } => "INDEX_NOT_FOUND",
            Self::SubredditNotIndexed { .. } => "SUBREDDIT_NOT_INDEXED",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::Corrupted { .. } => "INDEX_CORRUPTED",
            Self::Io { .. } => "IO_ERROR",
            Self::Embedding(_) => "EMBEDDING_FAILED",
        }
    }

    /// True when running a build for the subreddit is enough to make the
    /// failing call succeed.
    pub fn is_recoverable_by_build(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::SubredditNotIndexed { .. })
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::NotFound { .. } | Self::SubredditNotIndexed { .. } => vec![
                "Run 'modsim build --input <posts.jsonl>' to create the index",
                "Check that index_dir points at the directory the builder wrote to",
            ],
            Self::Training { .. } => vec![
                "Retry the build with a smaller --nlist",
                "Check the corpus for many identical posts",
            ],
            Self::DimensionMismatch { .. } => vec![
                "Rebuild the index with the embedding model used for queries",
            ],
            Self::Corrupted { .. } => vec![
                "Rebuild the index for this subreddit",
                "Check for disk errors or a build that was interrupted mid-publish",
            ],
            Self::Io { .. } => vec!["Check disk space and permissions in the index directory"],
            Self::DuplicateDocument { .. } => vec![
                "Deduplicate the input dump",
                "Or set build.duplicate_policy = \"last_write_wins\"",
            ],
            _ => vec![],
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Rebuilds I/O errors from their kind and message, since `std::io::Error`
/// is not `Clone`. Lets a failed cache load be reported to every waiter.
impl Clone for IndexError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidInput { reason } => Self::InvalidInput {
                reason: reason.clone(),
            },
            Self::DuplicateDocument {
                document_id,
                first,
                second,
            } => Self::DuplicateDocument {
                document_id: document_id.clone(),
                first: *first,
                second: *second,
            },
            Self::InvalidSubreddit { name } => Self::InvalidSubreddit { name: name.clone() },
            Self::Training { subreddit, source } => Self::Training {
                subreddit: subreddit.clone(),
                source: source.clone(),
            },
            Self::NotFound { subreddit, path } => Self::NotFound {
                subreddit: subreddit.clone(),
                path: path.clone(),
            },
            Self::SubredditNotIndexed { subreddit } => Self::SubredditNotIndexed {
                subreddit: subreddit.clone(),
            },
            Self::DimensionMismatch { expected, actual } => Self::DimensionMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::Corrupted { path, reason } => Self::Corrupted {
                path: path.clone(),
                reason: reason.clone(),
            },
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::Embedding(message) => Self::Embedding(message.clone()),
        }
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;
