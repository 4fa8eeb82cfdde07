//! K-means clustering that trains the coarse quantizer of the IVF-Flat index.
//!
//! Pure Rust Lloyd iterations over squared Euclidean distance, seeded with
//! K-means++ so that a fixed seed always yields the same centroids.
//!
//! # Algorithm Details
//! - Distance metric: squared L2 (the same metric the index searches with)
//! - Initialization: K-means++ from a seeded `StdRng`
//! - Empty clusters: repaired by moving the worst-fitting point into them
//! - Assignment step runs on rayon for large batches

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::vector::types::ListId;

/// Default cap on Lloyd iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 25;

/// Convergence tolerance on the largest squared centroid shift.
const CONVERGENCE_TOLERANCE: f32 = 1e-8;

/// Below this squared distance two points count as coincident.
const EPSILON: f64 = 1e-12;

/// Batches smaller than this are assigned on the calling thread.
const PARALLEL_THRESHOLD: usize = 2048;

/// Parameters for one clustering run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeansConfig {
    /// Number of clusters to produce
    pub k: usize,
    pub max_iterations: usize,
    /// Seed for K-means++ initialization
    pub seed: u64,
}

impl KMeansConfig {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            seed: 42,
        }
    }
}

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster centroids, each a vector of the same dimension as input vectors.
    pub centroids: Vec<Vec<f32>>,

    /// Cluster assignment for each input vector, consistent with `centroids`.
    pub assignments: Vec<ListId>,

    /// Number of Lloyd iterations performed.
    pub iterations: usize,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug, Clone)]
pub enum ClusteringError {
    #[error("Empty vector set provided for clustering")]
    EmptyVectorSet,

    #[error("Invalid cluster count {k} for {vectors} vectors: use k between 1 and the number of vectors")]
    InvalidClusterCount { k: usize, vectors: usize },

    #[error("Vector {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Vector {index} contains a NaN or infinite component")]
    NonFiniteValue { index: usize },

    #[error(
        "Only {distinct} distinct vectors available for {requested} clusters; lower nlist or remove duplicate posts"
    )]
    DegenerateInput { distinct: usize, requested: usize },

    #[error("Cluster {cluster} became empty and no point could be moved into it")]
    EmptyCluster { cluster: usize },
}

/// Performs K-means clustering on a set of vectors using squared L2 distance.
///
/// # Arguments
/// * `vectors` - Input vectors to cluster (must be non-empty and same dimension)
/// * `config` - Cluster count, iteration cap and seed
///
/// # Algorithm
/// 1. Initialize centroids using K-means++
/// 2. Iterate until assignments stop changing, centroids stop moving, or the
///    iteration cap is hit:
///    - Recompute centroids as the mean of their members
///    - Reassign every vector to its nearest centroid
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans_clustering(
    vectors: &[&[f32]],
    config: &KMeansConfig,
) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }

    let k = config.k;
    if k == 0 || k > vectors.len() {
        return Err(ClusteringError::InvalidClusterCount {
            k,
            vectors: vectors.len(),
        });
    }

    let dimension = vectors[0].len();
    for (index, vector) in vectors.iter().enumerate() {
        if vector.len() != dimension {
            return Err(ClusteringError::DimensionMismatch {
                index,
                expected: dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ClusteringError::NonFiniteValue { index });
        }
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut centroids = initialize_centroids_kmeans_plus_plus(vectors, k, &mut rng)?;
    let mut assignments = assign_all(vectors, &centroids);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iterations {
        iterations += 1;

        let new_centroids = update_centroids(vectors, &mut assignments, &centroids)?;
        let movement = max_centroid_shift(&centroids, &new_centroids);
        centroids = new_centroids;

        let new_assignments = assign_all(vectors, &centroids);
        let stable = new_assignments == assignments;
        assignments = new_assignments;

        if stable || movement < CONVERGENCE_TOLERANCE {
            converged = true;
            break;
        }
    }

    if converged {
        debug!(k, iterations, "k-means converged");
    } else {
        warn!(
            k,
            iterations, "k-means stopped at the iteration cap before converging"
        );
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// Squared Euclidean distance between two vectors of equal length.
///
/// Accumulates in `f32` in index order, so the result is reproducible for the
/// same inputs.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Assigns a vector to the nearest centroid by squared L2 distance.
///
/// Ties go to the lowest list id.
pub fn assign_to_nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> ListId {
    let mut best_distance = f32::INFINITY;
    let mut best_cluster = 0;

    for (i, centroid) in centroids.iter().enumerate() {
        let distance = squared_l2(vector, centroid);
        if distance < best_distance {
            best_distance = distance;
            best_cluster = i;
        }
    }

    ListId::new(best_cluster as u32)
}

fn assign_all(vectors: &[&[f32]], centroids: &[Vec<f32>]) -> Vec<ListId> {
    if vectors.len() >= PARALLEL_THRESHOLD {
        vectors
            .par_iter()
            .map(|vector| assign_to_nearest_centroid(vector, centroids))
            .collect()
    } else {
        vectors
            .iter()
            .map(|vector| assign_to_nearest_centroid(vector, centroids))
            .collect()
    }
}

/// Recomputes centroids as member means and repairs empty clusters.
///
/// An empty cluster takes over the point that sits farthest from its own
/// centroid, provided that point's cluster keeps at least one other member.
fn update_centroids(
    vectors: &[&[f32]],
    assignments: &mut [ListId],
    previous: &[Vec<f32>],
) -> Result<Vec<Vec<f32>>, ClusteringError> {
    let k = previous.len();
    let dimension = vectors[0].len();
    let mut sums = vec![vec![0.0f64; dimension]; k];
    let mut sizes = vec![0usize; k];

    for (vector, cluster) in vectors.iter().zip(assignments.iter()) {
        let idx = cluster.index();
        for (sum, &value) in sums[idx].iter_mut().zip(vector.iter()) {
            *sum += f64::from(value);
        }
        sizes[idx] += 1;
    }

    let mut centroids: Vec<Vec<f32>> = sums
        .iter()
        .zip(sizes.iter())
        .zip(previous.iter())
        .map(|((sum, &size), old)| {
            if size == 0 {
                old.clone()
            } else {
                sum.iter().map(|s| (s / size as f64) as f32).collect()
            }
        })
        .collect();

    for cluster in 0..k {
        if sizes[cluster] > 0 {
            continue;
        }

        let donor = vectors
            .iter()
            .zip(assignments.iter())
            .enumerate()
            .filter(|(_, (_, owner))| sizes[owner.index()] > 1)
            .map(|(i, (vector, owner))| (i, squared_l2(vector, &centroids[owner.index()])))
            .filter(|(_, distance)| f64::from(*distance) > EPSILON)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));

        let Some((point, _)) = donor else {
            return Err(ClusteringError::EmptyCluster { cluster });
        };

        sizes[assignments[point].index()] -= 1;
        sizes[cluster] = 1;
        assignments[point] = ListId::new(cluster as u32);
        centroids[cluster] = vectors[point].to_vec();
        debug!(cluster, point, "repaired empty k-means cluster");
    }

    Ok(centroids)
}

/// Initializes centroids using the K-means++ algorithm.
///
/// Points identical to an already chosen centroid have zero weight and are
/// never picked again, so fewer than `k` distinct points is an error.
fn initialize_centroids_kmeans_plus_plus(
    vectors: &[&[f32]],
    k: usize,
    rng: &mut StdRng,
) -> Result<Vec<Vec<f32>>, ClusteringError> {
    let mut centroids = Vec::with_capacity(k);

    let first_idx = rng.random_range(0..vectors.len());
    centroids.push(vectors[first_idx].to_vec());

    let mut min_distances: Vec<f64> = vectors
        .iter()
        .map(|v| f64::from(squared_l2(v, &centroids[0])))
        .collect();

    while centroids.len() < k {
        let total: f64 = min_distances.iter().sum();
        if total <= EPSILON {
            break;
        }

        let target = rng.random::<f64>() * total;
        let mut cumulative = 0.0;
        let mut chosen = None;
        for (i, &distance) in min_distances.iter().enumerate() {
            if distance <= EPSILON {
                continue;
            }
            cumulative += distance;
            if cumulative >= target {
                chosen = Some(i);
                break;
            }
        }

        // Rounding can leave the target just past the last weight.
        let chosen = chosen.or_else(|| {
            min_distances
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > EPSILON)
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
        });
        let Some(chosen) = chosen else {
            break;
        };

        let centroid = vectors[chosen].to_vec();
        for (min_distance, vector) in min_distances.iter_mut().zip(vectors.iter()) {
            let distance = f64::from(squared_l2(vector, &centroid));
            if distance < *min_distance {
                *min_distance = distance;
            }
        }
        centroids.push(centroid);
    }

    if centroids.len() != k {
        return Err(ClusteringError::DegenerateInput {
            distinct: centroids.len(),
            requested: k,
        });
    }

    Ok(centroids)
}

/// Largest squared movement of any centroid between two iterations.
fn max_centroid_shift(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(old_c, new_c)| squared_l2(old_c, new_c))
        .fold(0.0, f32::max)
}
