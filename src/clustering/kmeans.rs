//! Seeded k-means on log-normalized expression of highly variable genes

use std::collections::HashMap;

use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_clustering::KMeans;
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::clustering::ClusterAssigner;
use crate::data::{ClusterLabels, CountMatrix};
use crate::error::{Result, ScnormError};
use crate::normalization::library_size_factors;

/// Parameters for the built-in k-means clusterer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeansParams {
    /// Requested number of clusters (capped at the number of cells)
    pub n_clusters: usize,
    /// Number of most variable genes used as features
    pub n_features: usize,
    /// Maximum Lloyd iterations per run
    pub max_iter: usize,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            n_clusters: 10,
            n_features: 500,
            max_iter: 100,
        }
    }
}

/// k-means with k-means++ initialization, seeded per call
#[derive(Debug, Clone, Default)]
pub struct KMeansClusters {
    pub params: KMeansParams,
}

impl KMeansClusters {
    pub fn new(params: KMeansParams) -> Self {
        Self { params }
    }
}

/// Cells x features matrix of `log2(1 + x / s)` over the most variable genes
fn feature_matrix(counts: &CountMatrix, n_features: usize) -> Result<Array2<f64>> {
    let sf = library_size_factors(counts)?;
    let mut logged = counts.counts().to_owned();
    for (mut column, &s) in logged.columns_mut().into_iter().zip(sf.iter()) {
        column.mapv_inplace(|x| (x / s).ln_1p() / std::f64::consts::LN_2);
    }

    let variances = logged.var_axis(Axis(1), 0.0);
    let mut genes: Vec<usize> = (0..counts.n_genes()).collect();
    genes.sort_by(|&a, &b| variances[b].total_cmp(&variances[a]).then(a.cmp(&b)));
    genes.truncate(n_features.max(1));
    genes.sort_unstable();

    Ok(logged.select(Axis(0), &genes).reversed_axes())
}

impl ClusterAssigner for KMeansClusters {
    fn assign(&self, counts: &CountMatrix, seed: u64) -> Result<ClusterLabels> {
        let n_cells = counts.n_cells();
        if n_cells == 0 {
            return Err(ScnormError::InsufficientData {
                reason: "No cells to cluster".to_string(),
            });
        }
        if self.params.n_clusters == 0 {
            return Err(ScnormError::InvalidInput {
                reason: "k-means needs at least one cluster".to_string(),
            });
        }

        let k = self.params.n_clusters.min(n_cells);
        let features = feature_matrix(counts, self.params.n_features)?;
        let dataset = DatasetBase::from(features.clone());

        let model = KMeans::params_with_rng(k, Pcg64::seed_from_u64(seed))
            .max_n_iterations(self.params.max_iter as u64)
            .tolerance(1e-6)
            .fit(&dataset)
            .map_err(|e| ScnormError::InsufficientData {
                reason: format!("k-means failed: {}", e),
            })?;
        let assignment: Array1<usize> = model.predict(&features);

        // Dense ids in order of first appearance; empty clusters disappear
        let mut dense: HashMap<usize, usize> = HashMap::new();
        let labels: Vec<usize> = assignment
            .iter()
            .map(|&c| {
                let next = dense.len();
                *dense.entry(c).or_insert(next)
            })
            .collect();

        log::info!("k-means assigned {} cells to {} clusters (seed {})", n_cells, dense.len(), seed);
        ClusterLabels::new(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two groups of cells expressing disjoint halves of the genes
    fn two_populations() -> CountMatrix {
        let data = Array2::from_shape_fn((40, 30), |(g, c)| {
            let in_group_a = c < 15;
            let high = (g < 20) == in_group_a;
            let base = if high { 50.0 } else { 1.0 };
            base + ((g * 3 + c * 5) % 7) as f64
        });
        CountMatrix::from_array(data).unwrap()
    }

    #[test]
    fn test_kmeans_separates_populations() {
        let counts = two_populations();
        let assigner = KMeansClusters::new(KMeansParams {
            n_clusters: 2,
            n_features: 40,
            max_iter: 50,
        });
        let labels = assigner.assign(&counts, 3).unwrap();
        assert_eq!(labels.n_clusters(), 2);

        let first = labels.labels()[0];
        assert!(labels.labels()[..15].iter().all(|&l| l == first));
        assert!(labels.labels()[15..].iter().all(|&l| l != first));
    }

    #[test]
    fn test_kmeans_same_seed_same_labels() {
        let counts = two_populations();
        let assigner = KMeansClusters::new(KMeansParams {
            n_clusters: 4,
            ..Default::default()
        });
        let a = assigner.assign(&counts, 99).unwrap();
        let b = assigner.assign(&counts, 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kmeans_rejects_zero_clusters() {
        let assigner = KMeansClusters::new(KMeansParams {
            n_clusters: 0,
            ..Default::default()
        });
        let err = assigner.assign(&two_populations(), 1).unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_kmeans_caps_clusters_at_cells() {
        let counts = CountMatrix::from_array(Array2::from_shape_fn((5, 3), |(g, c)| (g + c + 1) as f64)).unwrap();
        let labels = KMeansClusters::default().assign(&counts, 0).unwrap();
        assert!(labels.n_clusters() <= 3);
        assert_eq!(labels.len(), 3);
    }
}
