//! Cluster assignment collaborators
//!
//! Pooled size factors only need a rough partition of cells into groups of
//! similar composition. The estimator accepts anything implementing
//! [`ClusterAssigner`]; the seed it receives is the only source of randomness.

mod kmeans;

pub use kmeans::{KMeansClusters, KMeansParams};

use crate::data::{ClusterLabels, CountMatrix};
use crate::error::{Result, ScnormError};

/// Assigns each cell of a count matrix to one cluster
pub trait ClusterAssigner {
    /// Partition the cells of `counts`. Randomized methods must draw only
    /// from an RNG seeded with `seed`.
    fn assign(&self, counts: &CountMatrix, seed: u64) -> Result<ClusterLabels>;
}

/// Precomputed labels, for when clustering happened elsewhere
#[derive(Debug, Clone)]
pub struct FixedClusters(pub ClusterLabels);

impl ClusterAssigner for FixedClusters {
    fn assign(&self, counts: &CountMatrix, _seed: u64) -> Result<ClusterLabels> {
        if self.0.len() != counts.n_cells() {
            return Err(ScnormError::DimensionMismatch {
                expected: format!("{} cluster labels", counts.n_cells()),
                got: format!("{} cluster labels", self.0.len()),
            });
        }
        Ok(self.0.clone())
    }
}
