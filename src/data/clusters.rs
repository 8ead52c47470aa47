//! Cluster membership of cells

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScnormError};

/// Assignment of every cell to exactly one cluster in `0..n_clusters`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLabels {
    labels: Vec<usize>,
    n_clusters: usize,
}

impl ClusterLabels {
    /// Create labels from dense cluster ids. Every id below the maximum must be used.
    pub fn new(labels: Vec<usize>) -> Result<Self> {
        let n_clusters = match labels.iter().max() {
            Some(&max) => max + 1,
            None => {
                return Err(ScnormError::InvalidInput {
                    reason: "Cluster labels are empty".to_string(),
                })
            }
        };

        let mut sizes = vec![0usize; n_clusters];
        for &label in &labels {
            sizes[label] += 1;
        }
        if let Some(empty) = sizes.iter().position(|&s| s == 0) {
            return Err(ScnormError::InvalidInput {
                reason: format!(
                    "Cluster {} has no cells; cluster ids must be dense in 0..{}",
                    empty, n_clusters
                ),
            });
        }

        Ok(Self { labels, n_clusters })
    }

    /// All cells in one cluster
    pub fn single(n_cells: usize) -> Result<Self> {
        Self::new(vec![0; n_cells])
    }

    /// Map arbitrary group names to dense ids in order of first appearance
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut ids: HashMap<&str, usize> = HashMap::new();
        let labels = names
            .iter()
            .map(|name| {
                let next = ids.len();
                *ids.entry(name.as_ref()).or_insert(next)
            })
            .collect();
        Self::new(labels)
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Cell indices belonging to cluster `k`, ascending
    pub fn members(&self, k: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == k)
            .map(|(i, _)| i)
            .collect()
    }

    /// Members of every cluster, indexed by cluster id
    pub fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.n_clusters];
        for (cell, &label) in self.labels.iter().enumerate() {
            groups[label].push(cell);
        }
        groups
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }
}
