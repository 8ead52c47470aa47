//! Downsampling of count matrices to a lower sequencing depth
//!
//! Each cell keeps a random subset of its molecules, drawn without
//! replacement. This equalizes depth between cells (or between datasets)
//! without any scaling, at the cost of discarding information.

use ndarray::Array2;
use rand::SeedableRng;
use rand_distr::{Distribution, Hypergeometric};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::data::CountMatrix;
use crate::error::{Result, ScnormError};

/// How many molecules each cell keeps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownsampleTarget {
    /// The same fraction of every cell's library
    Proportion(f64),
    /// A separate fraction for every cell
    PerCell(Vec<f64>),
    /// Every cell down to the smallest library size in the matrix
    MinLibrarySize,
}

/// Downsample every cell to its target depth.
///
/// Counts must be integer valued. The number of molecules kept by cell `j`
/// is `round(p_j * library_size_j)`; the same seed always yields the same
/// matrix.
pub fn downsample_counts(counts: &CountMatrix, target: &DownsampleTarget, seed: u64) -> Result<CountMatrix> {
    if !counts.is_integer_valued() {
        return Err(ScnormError::InvalidInput {
            reason: "Downsampling requires integer counts".to_string(),
        });
    }

    let lib_sizes = counts.library_sizes();
    let n_cells = counts.n_cells();

    let proportions: Vec<f64> = match target {
        DownsampleTarget::Proportion(p) => vec![*p; n_cells],
        DownsampleTarget::PerCell(ps) => {
            if ps.len() != n_cells {
                return Err(ScnormError::DimensionMismatch {
                    expected: format!("{} proportions", n_cells),
                    got: format!("{} proportions", ps.len()),
                });
            }
            ps.clone()
        }
        DownsampleTarget::MinLibrarySize => {
            let min_lib = lib_sizes.iter().copied().fold(f64::INFINITY, f64::min);
            lib_sizes
                .iter()
                .map(|&lib| if lib > 0.0 { min_lib / lib } else { 1.0 })
                .collect()
        }
    };

    if let Some(&bad) = proportions.iter().find(|&&p| !(0.0..=1.0).contains(&p)) {
        return Err(ScnormError::InvalidInput {
            reason: format!("Downsampling proportion {} is outside [0, 1]", bad),
        });
    }

    let mut rng = Pcg64::seed_from_u64(seed);
    let mut result = Array2::<f64>::zeros((counts.n_genes(), n_cells));

    for j in 0..n_cells {
        let cell = counts.cell_counts(j);
        let mut remaining_total = lib_sizes[j] as u64;
        let mut remaining_draws = (proportions[j] * lib_sizes[j]).round() as u64;

        for (g, &count) in cell.iter().enumerate() {
            if remaining_draws == 0 {
                break;
            }
            let count = count as u64;
            if count == 0 {
                continue;
            }

            let kept = if remaining_draws >= remaining_total {
                count
            } else {
                Hypergeometric::new(remaining_total, count, remaining_draws)
                    .map_err(|e| ScnormError::InvalidInput {
                        reason: format!("Cannot sample cell '{}': {}", counts.cell_ids()[j], e),
                    })?
                    .sample(&mut rng)
            };

            result[[g, j]] = kept as f64;
            remaining_draws -= kept;
            remaining_total -= count;
        }
    }

    log::debug!("Downsampled {} cells with seed {}", n_cells, seed);

    CountMatrix::new(result, counts.gene_ids().to_vec(), counts.cell_ids().to_vec())
}
