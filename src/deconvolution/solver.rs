//! Pooled size factors and the linear system linking them to cells

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::deadline::Deadline;
use super::linalg::{numerical_rank, LinearSystem};
use super::pools::{membership_gram, ring_windows_full_rank, Pool};
use crate::data::CountMatrix;
use crate::error::{Result, ScnormError};
use crate::stats::trimmed_location;

/// Size factor estimated for one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledFactor {
    pub pool: Pool,
    /// Ratio of the pooled profile to the reference. A pool of `w` cells
    /// matching the reference exactly has factor `w`.
    pub factor: f64,
}

/// Cells x genes matrix of expression proportions (counts over library size)
pub(crate) fn cell_profiles(counts: &CountMatrix, lib_sizes: &[f64]) -> Array2<f64> {
    let mut profiles = counts.counts().t().to_owned();
    for (mut row, &lib) in profiles.axis_iter_mut(Axis(0)).zip(lib_sizes.iter()) {
        row.mapv_inplace(|x| x / lib);
    }
    profiles
}

/// Reference pseudo-cell restricted to the genes it keeps
#[derive(Debug, Clone)]
pub(crate) struct Reference {
    /// Kept gene indices, ascending
    pub genes: Vec<usize>,
    /// Reference proportion of each kept gene
    pub values: Array1<f64>,
}

/// Average of `pooled / pool size` over all window pools.
///
/// Each pool contributes `sum_{c in pool} profile_c / |pool|`, so the
/// reference is a weighted sum of cell profiles with weight
/// `sum_{pools containing c} 1 / |pool|`. Genes are kept when the reference
/// is positive and its value scaled to the mean library size reaches
/// `min_mean`.
pub(crate) fn reference_profile<'a, I>(profiles: ArrayView2<f64>, window_pools: I, mean_lib: f64, min_mean: f64) -> Result<Reference>
where
    I: IntoIterator<Item = &'a Pool>,
{
    let mut weights = vec![0.0; profiles.nrows()];
    let mut n_pools = 0usize;
    for pool in window_pools {
        let w = 1.0 / pool.len() as f64;
        for &cell in &pool.members {
            weights[cell] += w;
        }
        n_pools += 1;
    }
    if n_pools == 0 {
        return Err(ScnormError::InsufficientData {
            reason: "No pools available to build a reference profile".to_string(),
        });
    }

    let n_pools = n_pools as f64;
    let mut average = Array1::<f64>::zeros(profiles.ncols());
    for (row, &w) in profiles.axis_iter(Axis(0)).zip(weights.iter()) {
        if w > 0.0 {
            average.scaled_add(w / n_pools, &row);
        }
    }

    let genes: Vec<usize> = average
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.0 && v * mean_lib >= min_mean)
        .map(|(g, _)| g)
        .collect();
    if genes.is_empty() {
        return Err(ScnormError::InsufficientData {
            reason: format!("No genes have an average count of at least {}", min_mean),
        });
    }

    log::debug!("Reference profile keeps {} of {} genes", genes.len(), profiles.ncols());
    let values = average.select(Axis(0), &genes);
    Ok(Reference { genes, values })
}

/// Robust ratio of a pool's summed profile to the reference.
/// `profiles` must already be restricted to the reference genes.
pub(crate) fn pooled_factor(profiles: ArrayView2<f64>, pool: &Pool, reference: &Array1<f64>, trim_fraction: f64) -> f64 {
    let mut pooled = Array1::<f64>::zeros(reference.len());
    for &cell in &pool.members {
        pooled += &profiles.row(cell);
    }
    let ratios: Vec<f64> = pooled.iter().zip(reference.iter()).map(|(p, r)| p / r).collect();
    trimmed_location(&ratios, trim_fraction).unwrap_or(f64::NAN)
}

/// Estimate every pool's factor in parallel, keeping input order.
/// Non-positive or non-finite factors are dropped.
pub(crate) fn estimate_pooled_factors(
    profiles: ArrayView2<f64>,
    pools: Vec<Pool>,
    reference: &Array1<f64>,
    trim_fraction: f64,
) -> Vec<PooledFactor> {
    let n_pools = pools.len();
    let factors: Vec<PooledFactor> = pools
        .into_par_iter()
        .filter_map(|pool| {
            let factor = pooled_factor(profiles, &pool, reference, trim_fraction);
            if factor.is_finite() && factor > 0.0 {
                Some(PooledFactor { pool, factor })
            } else {
                log::debug!("Dropping pool of {} cells with factor {}", pool.len(), factor);
                None
            }
        })
        .collect();

    if factors.len() < n_pools {
        log::debug!("{} of {} pools had no usable factor", n_pools - factors.len(), n_pools);
    }
    factors
}

/// Whether a working cluster's window pools determine its cells uniquely.
///
/// When every stride-one window was kept, the circulant criterion decides
/// this exactly in `O(n * sizes)`. Otherwise the rank of the dense `n x n`
/// membership Gram matrix is computed by pivoted QR, which is `O(n^3)` and
/// honours `deadline`.
pub(crate) fn cluster_is_full_rank(
    cells: &[usize],
    pools: &[&Pool],
    window_sizes: &[usize],
    complete_ring: bool,
    rank_tolerance: f64,
    deadline: &Deadline,
) -> Result<bool> {
    if cells.is_empty() {
        return Ok(false);
    }
    if complete_ring {
        return Ok(ring_windows_full_rank(cells.len(), window_sizes));
    }
    log::debug!("Dense rank check for {} cells ({} pools)", cells.len(), pools.len());
    let gram = membership_gram(cells, pools);
    let rank = numerical_rank(&gram, rank_tolerance, deadline)?;
    log::debug!("Membership rank {} for {} cells", rank, cells.len());
    Ok(rank == cells.len())
}

/// One row per pooled factor over the columns `cells` (ascending), plus
/// `anchor_weight * theta_i = anchor_weight` for every cell when positive
pub(crate) fn assemble_system(cells: &[usize], factors: &[PooledFactor], anchor_weight: f64) -> Result<LinearSystem> {
    let column = |cell: usize| cells.binary_search(&cell).ok();
    let anchors = if anchor_weight > 0.0 { cells.len() } else { 0 };
    let n_rows = factors.len() + anchors;

    let mut triplets = Vec::with_capacity(factors.iter().map(|f| f.pool.len()).sum::<usize>() + anchors);
    let mut rhs = Array1::<f64>::zeros(n_rows);
    for (row, pf) in factors.iter().enumerate() {
        for &cell in &pf.pool.members {
            let col = column(cell).ok_or_else(|| ScnormError::InvalidInput {
                reason: format!("Pool member {} is not an unknown of the system", cell),
            })?;
            triplets.push((row, col, 1.0));
        }
        rhs[row] = pf.factor;
    }
    for col in 0..anchors {
        let row = factors.len() + col;
        triplets.push((row, col, anchor_weight));
        rhs[row] = anchor_weight;
    }

    LinearSystem::from_triplets(n_rows, cells.len(), &triplets, rhs)
}
