//! Genes x cells count matrix for single-cell RNA-seq data

use std::collections::HashMap;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{Result, ScnormError};

/// Append `_1`, `_2`, ... to repeated gene names so every row id is unique
fn deduplicate_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for name in &names {
        *seen.entry(name.clone()).or_insert(0) += 1;
    }
    if seen.values().all(|&c| c == 1) {
        return names;
    }

    seen.clear();
    let mut result = Vec::with_capacity(names.len());
    for name in names {
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            result.push(name);
        } else {
            let new_name = format!("{}_{}", name, *count - 1);
            log::warn!("Duplicate gene name '{}' renamed to '{}'", name, new_name);
            result.push(new_name);
        }
    }
    result
}

/// A count matrix of non-negative expression values.
/// Rows are genes, columns are cells.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    /// Raw counts (genes x cells)
    counts: Array2<f64>,
    /// Gene identifiers
    gene_ids: Vec<String>,
    /// Cell identifiers (barcodes)
    cell_ids: Vec<String>,
}

impl CountMatrix {
    /// Create a new count matrix, checking dimensions and values
    pub fn new(counts: Array2<f64>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        let (n_genes, n_cells) = counts.dim();

        if gene_ids.len() != n_genes {
            return Err(ScnormError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }

        if cell_ids.len() != n_cells {
            return Err(ScnormError::DimensionMismatch {
                expected: format!("{} cell IDs", n_cells),
                got: format!("{} cell IDs", cell_ids.len()),
            });
        }

        if let Some(((gene, cell), &value)) = counts
            .indexed_iter()
            .find(|(_, &x)| x < 0.0 || !x.is_finite())
        {
            return Err(ScnormError::InvalidInput {
                reason: format!(
                    "Counts must be non-negative finite values (found {} for gene {} in cell {})",
                    value, gene_ids[gene], cell_ids[cell]
                ),
            });
        }

        if counts.iter().any(|&x| x != x.round()) {
            log::warn!(
                "Some count values are not integers; treating them as already processed expression values"
            );
        }

        let gene_ids = deduplicate_names(gene_ids);

        Ok(Self {
            counts,
            gene_ids,
            cell_ids,
        })
    }

    /// Create from integer UMI counts
    pub fn from_integers(counts: Array2<u32>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        Self::new(counts.mapv(f64::from), gene_ids, cell_ids)
    }

    /// Create from a bare array, naming rows `gene{i}` and columns `cell{j}`
    pub fn from_array(counts: Array2<f64>) -> Result<Self> {
        let gene_ids = (0..counts.nrows()).map(|i| format!("gene{}", i)).collect();
        let cell_ids = (0..counts.ncols()).map(|j| format!("cell{}", j)).collect();
        Self::new(counts, gene_ids, cell_ids)
    }

    /// Number of genes
    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    /// Number of cells
    pub fn n_cells(&self) -> usize {
        self.counts.ncols()
    }

    /// The raw counts as a view
    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Counts for one gene across all cells
    pub fn gene_counts(&self, gene_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.row(gene_idx)
    }

    /// Counts for one cell across all genes
    pub fn cell_counts(&self, cell_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.column(cell_idx)
    }

    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    pub fn cell_index(&self, cell_id: &str) -> Option<usize> {
        self.cell_ids.iter().position(|id| id == cell_id)
    }

    /// Total counts per cell (library size)
    pub fn library_sizes(&self) -> Array1<f64> {
        self.counts.sum_axis(Axis(0))
    }

    /// True when every entry is a whole number
    pub fn is_integer_valued(&self) -> bool {
        self.counts.iter().all(|&x| x == x.round())
    }

    /// Subset to specific cells, in the given order
    pub fn subset_cells(&self, cell_indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = cell_indices.iter().find(|&&j| j >= self.n_cells()) {
            return Err(ScnormError::InvalidInput {
                reason: format!("Cell index {} out of range for {} cells", bad, self.n_cells()),
            });
        }
        let new_counts = self.counts.select(Axis(1), cell_indices);
        let new_cell_ids = cell_indices.iter().map(|&j| self.cell_ids[j].clone()).collect();
        Self::new(new_counts, self.gene_ids.clone(), new_cell_ids)
    }

    /// Subset to specific genes, in the given order
    pub fn subset_genes(&self, gene_indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = gene_indices.iter().find(|&&i| i >= self.n_genes()) {
            return Err(ScnormError::InvalidInput {
                reason: format!("Gene index {} out of range for {} genes", bad, self.n_genes()),
            });
        }
        let new_counts = self.counts.select(Axis(0), gene_indices);
        let new_gene_ids = gene_indices.iter().map(|&i| self.gene_ids[i].clone()).collect();
        Self::new(new_counts, new_gene_ids, self.cell_ids.clone())
    }
}
