//! IVF-Flat index: a trained flat-L2 coarse quantizer plus one inverted list
//! of uncompressed vectors per centroid.
//!
//! At search time only the `nprobe` lists whose centroids sit closest to the
//! query are scanned. Vectors keep the internal position they were added
//! under, which is what the id table is aligned to.

use crate::error::{IndexError, IndexResult};
use crate::vector::clustering::{
    ClusteringError, KMeansConfig, assign_to_nearest_centroid, kmeans_clustering, squared_l2,
};
use crate::vector::types::{ListId, SearchHit, VectorDimension};

/// Members of one cluster: internal positions and their flattened vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvertedList {
    positions: Vec<u32>,
    /// `positions.len() * dimension` values, row-major
    vectors: Vec<f32>,
}

impl InvertedList {
    pub(crate) fn from_parts(positions: Vec<u32>, vectors: Vec<f32>) -> Self {
        Self { positions, vectors }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    fn push(&mut self, position: u32, vector: &[f32]) {
        self.positions.push(position);
        self.vectors.extend_from_slice(vector);
    }
}

/// In-memory IVF-Flat index.
///
/// Trained once from a batch and filled by the builder; read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct IvfFlatIndex {
    dimension: VectorDimension,
    centroids: Vec<Vec<f32>>,
    lists: Vec<InvertedList>,
    vector_count: usize,
}

impl IvfFlatIndex {
    /// Trains the coarse quantizer on `vectors` and returns an empty index
    /// with `config.k` inverted lists.
    pub fn train(
        dimension: VectorDimension,
        vectors: &[&[f32]],
        config: &KMeansConfig,
    ) -> Result<Self, ClusteringError> {
        let result = kmeans_clustering(vectors, config)?;
        if let Some(centroid) = result.centroids.first()
            && centroid.len() != dimension.get()
        {
            return Err(ClusteringError::DimensionMismatch {
                index: 0,
                expected: dimension.get(),
                actual: centroid.len(),
            });
        }

        let nlist = result.centroids.len();
        Ok(Self {
            dimension,
            centroids: result.centroids,
            lists: vec![InvertedList::default(); nlist],
            vector_count: 0,
        })
    }

    /// Rebuilds an index from persisted parts, checking that the lists
    /// describe exactly the positions `0..vector_count`.
    pub(crate) fn from_parts(
        dimension: VectorDimension,
        centroids: Vec<Vec<f32>>,
        lists: Vec<InvertedList>,
    ) -> Result<Self, String> {
        if centroids.len() != lists.len() {
            return Err(format!(
                "{} centroids but {} inverted lists",
                centroids.len(),
                lists.len()
            ));
        }
        if centroids.iter().any(|c| c.len() != dimension.get()) {
            return Err("centroid dimension does not match header".to_string());
        }

        let vector_count: usize = lists.iter().map(InvertedList::len).sum();
        let mut seen = vec![false; vector_count];
        for (list_id, list) in lists.iter().enumerate() {
            if list.vectors.len() != list.positions.len() * dimension.get() {
                return Err(format!("list {list_id} has a truncated vector block"));
            }
            for &position in &list.positions {
                match seen.get_mut(position as usize) {
                    Some(slot) if !*slot => *slot = true,
                    _ => {
                        return Err(format!(
                            "list {list_id} holds invalid or repeated position {position}"
                        ));
                    }
                }
            }
        }

        Ok(Self {
            dimension,
            centroids,
            lists,
            vector_count,
        })
    }

    /// Appends vectors in order; the i-th vector gets position
    /// `vector_count + i`.
    pub(crate) fn add(&mut self, vectors: &[&[f32]]) -> IndexResult<()> {
        for vector in vectors {
            self.dimension.validate_vector(vector)?;
        }
        if self.vector_count + vectors.len() > u32::MAX as usize {
            return Err(IndexError::InvalidInput {
                reason: format!(
                    "an index holds at most {} vectors",
                    u32::MAX
                ),
            });
        }

        for vector in vectors {
            let list = assign_to_nearest_centroid(vector, &self.centroids);
            let position = self.vector_count as u32;
            self.lists[list.index()].push(position, vector);
            self.vector_count += 1;
        }
        Ok(())
    }

    /// Finds up to `k` nearest stored vectors by squared L2 distance.
    ///
    /// Probes the `nprobe` closest lists (clamped to `nlist`). Hits come back
    /// in ascending distance, ties broken by position. Fewer than `k` hits
    /// are returned when the probed lists hold fewer vectors.
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> IndexResult<Vec<SearchHit>> {
        self.dimension.validate_vector(query)?;
        if query.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::InvalidInput {
                reason: "query vector contains a NaN or infinite component".to_string(),
            });
        }
        if k == 0 {
            return Err(IndexError::InvalidInput {
                reason: "k must be at least 1".to_string(),
            });
        }
        if nprobe == 0 {
            return Err(IndexError::InvalidInput {
                reason: "search breadth must be at least 1".to_string(),
            });
        }

        let dim = self.dimension.get();
        let mut hits = Vec::new();
        for list_id in self.probe_order(query, nprobe) {
            let list = &self.lists[list_id.index()];
            for (&position, vector) in list.positions.iter().zip(list.vectors.chunks_exact(dim)) {
                hits.push(SearchHit {
                    position,
                    distance: squared_l2(query, vector),
                });
            }
        }

        let by_distance = |a: &SearchHit, b: &SearchHit| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        };
        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, by_distance);
            hits.truncate(k);
        }
        hits.sort_unstable_by(by_distance);
        Ok(hits)
    }

    /// The `nprobe` lists whose centroids are closest to `query`.
    fn probe_order(&self, query: &[f32], nprobe: usize) -> Vec<ListId> {
        let mut ranked: Vec<(f32, ListId)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, centroid)| (squared_l2(query, centroid), ListId::new(i as u32)))
            .collect();
        ranked.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(nprobe.min(self.centroids.len()))
            .map(|(_, id)| id)
            .collect()
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// Number of inverted lists.
    #[must_use]
    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    #[must_use]
    pub fn vector_count(&self) -> usize {
        self.vector_count
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    pub fn lists(&self) -> &[InvertedList] {
        &self.lists
    }

    pub fn list_sizes(&self) -> Vec<usize> {
        self.lists.iter().map(InvertedList::len).collect()
    }
}
