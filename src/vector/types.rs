//! Type-safe wrappers and core types for the similarity index.
//!
//! Newtypes here keep dimensions, inverted-list ids and internal positions
//! from being mixed up with plain integers.

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Output dimension of the default embedding model (all-MiniLM-L6-v2).
pub const VECTOR_DIMENSION_384: usize = 384;

/// Type-safe wrapper for vector dimensions.
///
/// Every vector handed to the builder or the query path is checked against
/// the dimension the index was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> IndexResult<Self> {
        if dim == 0 {
            return Err(IndexError::InvalidInput {
                reason: "vector dimension cannot be zero".to_string(),
            });
        }
        Ok(Self(dim))
    }

    /// Creates the standard 384-dimensional vector dimension.
    #[must_use]
    pub const fn dimension_384() -> Self {
        Self(VECTOR_DIMENSION_384)
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> IndexResult<()> {
        if vector.len() != self.0 {
            return Err(IndexError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Identifier of one inverted list (one coarse-quantizer cluster).
///
/// Lists are numbered from zero in centroid order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListId(u32);

impl ListId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// The list id as a slice index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ListId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One historical post ready to be indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Reddit submission id
    pub document_id: String,
    pub embedding: Vec<f32>,
}

impl DocumentRecord {
    pub fn new(document_id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            document_id: document_id.into(),
            embedding,
        }
    }
}

/// Ordered document ids, positionally aligned with the vectors of an index.
///
/// Position `i` always names the document stored at internal position `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdTable(Vec<String>);

impl IdTable {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolves an internal position to its document id.
    ///
    /// Returns `None` for positions past the end of the table.
    #[must_use]
    pub fn resolve(&self, position: u32) -> Option<&str> {
        self.0.get(position as usize).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Raw hit from an index search: internal position and squared L2 distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub position: u32,
    pub distance: f32,
}

/// A resolved neighbor in a similarity result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub document_id: String,
    /// Squared L2 distance to the query
    pub distance: f32,
    /// `1 / (1 + distance)`
    pub similarity: f32,
}

/// Outcome of scoring one post against one subreddit's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub subreddit: String,
    /// Harmonic mean of the per-neighbor similarities, in [0, 1]
    pub similarity_score: f32,
    pub avg_distance: f32,
    pub min_distance: f32,
    pub max_distance: f32,
    #[serde(alias = "nearest_neighbors")]
    pub neighbors: Vec<Neighbor>,
}

/// Checks that a subreddit name is safe to use as a file name key.
///
/// Reddit names are ASCII letters, digits and underscores; anything else is
/// rejected before it can reach the filesystem.
pub fn validate_subreddit(name: &str) -> IndexResult<()> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(IndexError::InvalidSubreddit {
            name: name.to_string(),
        })
    }
}
