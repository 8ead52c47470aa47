//! Pooled deconvolution of per-cell size factors
//!
//! Single-cell counts are too sparse for a per-cell median ratio. Instead,
//! cells within a cluster are summed into many overlapping pools, each pool
//! gets a robust ratio against a reference pseudo-cell, and the per-cell
//! factors are recovered by least squares from the pool memberships.

mod deadline;
mod estimate;
mod linalg;
mod pools;
mod solver;

pub use deadline::Deadline;
pub use estimate::{ClusterFailure, FailureKind, SizeFactorEstimate};
pub use linalg::{LinearSolver, LinearSystem};
pub use pools::{Pool, PoolKind, DEFAULT_MIN_POOL_SIZE};
pub use solver::PooledFactor;

use std::time::Duration;

use ndarray::Axis;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::clustering::ClusterAssigner;
use crate::data::{ClusterLabels, CountMatrix};
use crate::error::{Result, ScnormError};
use crate::stats::mean;
use pools::{effective_min_pool_size, working_clusters, PoolBuilder};
use solver::{assemble_system, cell_profiles, cluster_is_full_rank, estimate_pooled_factors, reference_profile};

/// Parameters for pooled size factor estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvolutionParams {
    /// Smallest pool size. `None` merges clusters below
    /// `min(21, largest cluster)` and picks window sizes per cluster from
    /// `min(21, n / 2)` to `n - 1`, adding a size coprime with `n` when needed.
    pub min_pool_size: Option<usize>,
    /// Largest pool size
    pub max_pool_size: usize,
    /// Increment between consecutive pool sizes
    pub pool_size_step: usize,
    /// Ring positions between consecutive window starts. Values above 1
    /// make the rank check build a dense Gram matrix per cluster, which
    /// costs `O(n^3)` in the cluster size.
    pub pool_step: usize,
    /// Fraction of pooled ratios discarded from each end; 0.5 takes the median
    pub trim_fraction: f64,
    /// Minimum average count, at the mean library size, for a gene to enter the ratios
    pub min_mean: f64,
    /// Clusters above this many cells are split before pooling
    pub max_cluster_size: usize,
    /// Pools linking each pair of consecutive clusters
    pub bridge_pools: usize,
    /// Weight of the library-size prior rows; 0 disables them
    pub anchor_weight: f64,
    /// Relative tolerance for the per-cluster rank check
    pub rank_tolerance: f64,
    /// Least-squares strategy for the joint system
    pub solver: LinearSolver,
    /// Seed handed to the cluster assigner
    pub random_seed: u64,
    /// Run on a dedicated rayon pool of this many threads
    pub n_threads: Option<usize>,
    /// Abort with `Timeout` once this much time has passed
    pub time_limit: Option<Duration>,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        Self {
            min_pool_size: None,
            max_pool_size: 101,
            pool_size_step: 5,
            pool_step: 1,
            trim_fraction: 0.5,
            min_mean: 0.1,
            max_cluster_size: 3000,
            bridge_pools: 10,
            anchor_weight: 0.0,
            rank_tolerance: 1e-10,
            solver: LinearSolver::default(),
            random_seed: 42,
            n_threads: None,
            time_limit: None,
        }
    }
}

impl DeconvolutionParams {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> { Err(ScnormError::InvalidInput { reason }) };

        if let Some(min) = self.min_pool_size {
            if min < 2 {
                return invalid(format!("min_pool_size must be at least 2, got {}", min));
            }
            if min > self.max_pool_size {
                return invalid(format!(
                    "min_pool_size {} exceeds max_pool_size {}",
                    min, self.max_pool_size
                ));
            }
        }
        if self.max_pool_size < 2 {
            return invalid(format!("max_pool_size must be at least 2, got {}", self.max_pool_size));
        }
        if self.pool_size_step == 0 || self.pool_step == 0 {
            return invalid("pool_size_step and pool_step must be at least 1".to_string());
        }
        if !(0.0..=0.5).contains(&self.trim_fraction) {
            return invalid(format!("trim_fraction must be in [0, 0.5], got {}", self.trim_fraction));
        }
        if !(self.min_mean.is_finite() && self.min_mean >= 0.0) {
            return invalid(format!("min_mean must be non-negative, got {}", self.min_mean));
        }
        let min_pool = self.min_pool_size.unwrap_or(DEFAULT_MIN_POOL_SIZE);
        if self.max_cluster_size < 2 * min_pool {
            return invalid(format!(
                "max_cluster_size {} must be at least twice the minimum pool size {}",
                self.max_cluster_size, min_pool
            ));
        }
        if !(self.anchor_weight.is_finite() && self.anchor_weight >= 0.0) {
            return invalid(format!("anchor_weight must be non-negative, got {}", self.anchor_weight));
        }
        if !(self.rank_tolerance > 0.0 && self.rank_tolerance < 1.0) {
            return invalid(format!("rank_tolerance must be in (0, 1), got {}", self.rank_tolerance));
        }
        if self.n_threads == Some(0) {
            return invalid("n_threads must be at least 1".to_string());
        }
        self.solver.validate()
    }
}

/// Estimate per-cell size factors by pooled deconvolution.
///
/// Invalid input, fewer than two cells, and an expired time limit are
/// errors. Clusters that cannot be estimated are reported in
/// [`SizeFactorEstimate::failures`] while the rest proceed.
pub fn compute_sum_factors(
    counts: &CountMatrix,
    clusters: &ClusterLabels,
    params: &DeconvolutionParams,
) -> Result<SizeFactorEstimate> {
    params.validate()?;
    match params.n_threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| ScnormError::ThreadPool { reason: e.to_string() })?;
            pool.install(|| run_deconvolution(counts, clusters, params))
        }
        None => run_deconvolution(counts, clusters, params),
    }
}

/// Cluster with `assigner`, seeded from `params.random_seed`, then deconvolve
pub fn compute_sum_factors_with(
    counts: &CountMatrix,
    assigner: &dyn ClusterAssigner,
    params: &DeconvolutionParams,
) -> Result<SizeFactorEstimate> {
    params.validate()?;
    check_cell_count(counts)?;
    let clusters = assigner.assign(counts, params.random_seed)?;
    compute_sum_factors(counts, &clusters, params)
}

fn check_cell_count(counts: &CountMatrix) -> Result<()> {
    if counts.n_cells() < 2 {
        return Err(ScnormError::InsufficientData {
            reason: format!("Need at least 2 cells to pool, got {}", counts.n_cells()),
        });
    }
    Ok(())
}

fn run_deconvolution(counts: &CountMatrix, clusters: &ClusterLabels, params: &DeconvolutionParams) -> Result<SizeFactorEstimate> {
    let deadline = Deadline::new(params.time_limit);
    let n_cells = counts.n_cells();

    if clusters.len() != n_cells {
        return Err(ScnormError::DimensionMismatch {
            expected: format!("{} cluster labels", n_cells),
            got: format!("{} cluster labels", clusters.len()),
        });
    }
    check_cell_count(counts)?;

    let lib_sizes = counts.library_sizes().to_vec();
    if let Some(cell) = lib_sizes.iter().position(|&lib| lib <= 0.0) {
        return Err(ScnormError::InvalidInput {
            reason: format!("Cell '{}' has a library size of zero", counts.cell_ids()[cell]),
        });
    }
    deadline.check("input validation")?;

    let mean_lib = mean(&lib_sizes).unwrap_or(0.0);
    let profiles = cell_profiles(counts, &lib_sizes);
    let min_size = effective_min_pool_size(params, clusters);
    let (working, mut failures) = working_clusters(
        clusters,
        &lib_sizes,
        profiles.view(),
        mean_lib,
        min_size,
        params.max_cluster_size,
    );
    log::info!(
        "Deconvolving {} cells in {} clusters ({} working groups, minimum pool size {})",
        n_cells,
        clusters.n_clusters(),
        working.len(),
        min_size
    );
    deadline.check("cluster preparation")?;

    if working.is_empty() {
        return SizeFactorEstimate::from_raw(vec![None; n_cells], failures, Vec::new());
    }

    // Per-cluster pools land in disjoint buffers, in cluster order
    let builder = PoolBuilder::new(&lib_sizes, min_size, params);
    let rings: Vec<Vec<usize>> = working.par_iter().map(|wc| builder.ring(&wc.cells)).collect();
    let window_sets: Vec<Vec<Pool>> = rings
        .par_iter()
        .enumerate()
        .map(|(k, ring)| builder.window_pools(k, ring))
        .collect();
    log::info!("Built {} window pools", window_sets.iter().map(Vec::len).sum::<usize>());
    deadline.check("pool construction")?;

    let reference = reference_profile(profiles.view(), window_sets.iter().flatten(), mean_lib, params.min_mean)?;
    let used = profiles.select(Axis(1), &reference.genes);
    deadline.check("reference profile")?;

    let mut window_factors = Vec::with_capacity(window_sets.len());
    for pools in window_sets {
        window_factors.push(estimate_pooled_factors(
            used.view(),
            pools,
            &reference.values,
            params.trim_fraction,
        ));
        deadline.check("pooled factor estimation")?;
    }

    let healthy: Vec<bool> = working
        .par_iter()
        .zip(window_factors.par_iter())
        .map(|(wc, factors)| {
            if params.anchor_weight > 0.0 {
                return Ok(true);
            }
            let n = wc.cells.len();
            let complete = params.pool_step == 1 && factors.len() == builder.expected_window_count(n);
            let refs: Vec<&Pool> = factors.iter().map(|f| &f.pool).collect();
            cluster_is_full_rank(
                &wc.cells,
                &refs,
                &builder.window_sizes(n),
                complete,
                params.rank_tolerance,
                &deadline,
            )
        })
        .collect::<Result<Vec<bool>>>()?;
    deadline.check("rank check")?;

    for (k, wc) in working.iter().enumerate() {
        if !healthy[k] {
            log::warn!(
                "Pools for cluster(s) {:?} do not determine the factors of its {} cells",
                wc.labels,
                wc.cells.len()
            );
            failures.push(ClusterFailure {
                clusters: wc.labels.clone(),
                cells: wc.cells.clone(),
                kind: FailureKind::SingularSystem,
                reason: format!(
                    "rank-deficient pool membership with window sizes {:?}",
                    builder.window_sizes(wc.cells.len())
                ),
            });
        }
    }

    let healthy_idx: Vec<usize> = (0..working.len()).filter(|&k| healthy[k]).collect();
    let bridges: Vec<Pool> = healthy_idx
        .windows(2)
        .flat_map(|pair| builder.bridge_pools((pair[0], rings[pair[0]].as_slice()), (pair[1], rings[pair[1]].as_slice())))
        .collect();
    let bridge_factors = estimate_pooled_factors(used.view(), bridges, &reference.values, params.trim_fraction);

    let mut cells: Vec<usize> = healthy_idx.iter().flat_map(|&k| working[k].cells.iter().copied()).collect();
    cells.sort_unstable();

    let mut system_factors: Vec<PooledFactor> = Vec::new();
    for &k in &healthy_idx {
        system_factors.extend(window_factors[k].iter().cloned());
    }
    system_factors.extend(bridge_factors);

    let mut raw_factors = vec![None; n_cells];
    if !cells.is_empty() {
        let system = assemble_system(&cells, &system_factors, params.anchor_weight)?;
        log::info!(
            "Solving {} pools for {} cells with {}",
            system.n_rows(),
            system.n_cols(),
            params.solver.name()
        );
        deadline.check("system assembly")?;

        match params.solver.solve(&system, &deadline) {
            Ok(theta) => {
                for (col, &cell) in cells.iter().enumerate() {
                    raw_factors[cell] = Some(theta[col] * lib_sizes[cell]);
                }
            }
            Err(ScnormError::SingularSystem { reason }) => {
                log::warn!("Joint solve failed: {}", reason);
                for &k in &healthy_idx {
                    failures.push(ClusterFailure {
                        clusters: working[k].labels.clone(),
                        cells: working[k].cells.clone(),
                        kind: FailureKind::SingularSystem,
                        reason: reason.clone(),
                    });
                }
            }
            Err(e) => return Err(e),
        }
    }

    for &k in &healthy_idx {
        let wc = &working[k];
        let bad = wc
            .cells
            .iter()
            .filter(|&&c| raw_factors[c].is_some_and(|f: f64| !(f.is_finite() && f > 0.0)))
            .count();
        if bad > 0 {
            log::warn!(
                "{} cells in cluster(s) {:?} received non-positive factors",
                bad,
                wc.labels
            );
            for &c in &wc.cells {
                raw_factors[c] = None;
            }
            failures.push(ClusterFailure {
                clusters: wc.labels.clone(),
                cells: wc.cells.clone(),
                kind: FailureKind::NonPositiveFactors,
                reason: format!("{} of {} solved factors were not positive", bad, wc.cells.len()),
            });
        }
    }

    let mut pooled_factors: Vec<PooledFactor> = window_factors.into_iter().flatten().collect();
    pooled_factors.extend(system_factors.into_iter().filter(|f| f.pool.kind == PoolKind::Bridge));

    let estimate = SizeFactorEstimate::from_raw(raw_factors, failures, pooled_factors)?;
    log::info!(
        "Estimated size factors for {} of {} cells",
        n_cells - estimate.flagged_cells().len(),
        n_cells
    );
    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::{FixedClusters, KMeansClusters, KMeansParams};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array2;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Cells 0..50 are exactly twice cells 50..100, which are all identical
    fn doubled_clusters() -> (CountMatrix, ClusterLabels) {
        let data = Array2::from_shape_fn((500, 100), |(g, c)| {
            let base = 1.0 + (g % 17) as f64;
            if c < 50 {
                2.0 * base
            } else {
                base
            }
        });
        let labels = (0..100).map(|c| if c < 50 { 0 } else { 1 }).collect();
        (
            CountMatrix::from_array(data).unwrap(),
            ClusterLabels::new(labels).unwrap(),
        )
    }

    /// Identical proportions, depth varying by cell
    fn varied_depth(n_cells: usize) -> CountMatrix {
        let data = Array2::from_shape_fn((200, n_cells), |(g, c)| {
            let depth = 1.0 + (c % 7) as f64;
            depth * (1.0 + (g % 11) as f64)
        });
        CountMatrix::from_array(data).unwrap()
    }

    /// Two cell types with mildly noisy expression
    fn noisy_two_types() -> (CountMatrix, ClusterLabels) {
        let data = Array2::from_shape_fn((300, 60), |(g, c)| {
            let type_a = c < 30;
            let marker = if (g < 150) == type_a { 3.0 } else { 1.0 };
            let depth = 1.0 + (c % 5) as f64 * 0.5;
            let noise = ((g * 31 + c * 17) % 7) as f64;
            (marker * depth * (4.0 + (g % 13) as f64) + noise).round()
        });
        let labels = (0..60).map(|c| usize::from(c >= 30)).collect();
        (
            CountMatrix::from_array(data).unwrap(),
            ClusterLabels::new(labels).unwrap(),
        )
    }

    #[test]
    fn test_doubled_cluster_has_twice_the_factor() {
        init_logger();
        let (counts, labels) = doubled_clusters();
        let est = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap();

        assert!(est.is_complete());
        assert!(est.failures.is_empty());
        let raw: Vec<f64> = est.raw_factors.iter().map(|f| f.unwrap()).collect();
        for &a in &raw[..50] {
            for &b in &raw[50..] {
                assert_relative_eq!(a / b, 2.0, max_relative = 1e-5);
            }
        }

        let sf = est.size_factors_array().unwrap();
        assert_eq!(sf.len(), 100);
        assert!(sf.iter().all(|&s| s > 0.0));
        assert_abs_diff_eq!(sf.mean().unwrap(), 1.0, epsilon = 1e-9);
        assert!(est.pooled_factors.iter().any(|f| f.pool.kind == PoolKind::Bridge));
    }

    #[test]
    fn test_single_cell_is_insufficient() {
        let counts = CountMatrix::from_array(Array2::from_elem((10, 1), 3.0)).unwrap();
        let labels = ClusterLabels::single(1).unwrap();
        let result = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default());
        assert!(matches!(result, Err(ScnormError::InsufficientData { .. })));
    }

    #[test]
    fn test_negative_counts_rejected() {
        let mut data = Array2::from_elem((10, 5), 3.0);
        data[[2, 3]] = -1.0;
        let result = CountMatrix::from_array(data);
        assert!(matches!(result, Err(ScnormError::InvalidInput { .. })));
    }

    #[test]
    fn test_zero_library_cell_rejected() {
        let mut data = Array2::from_elem((10, 30), 3.0);
        data.column_mut(4).fill(0.0);
        let counts = CountMatrix::from_array(data).unwrap();
        let labels = ClusterLabels::single(30).unwrap();
        let err = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_label_length_checked() {
        let counts = varied_depth(30);
        let labels = ClusterLabels::single(29).unwrap();
        let result = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default());
        assert!(matches!(result, Err(ScnormError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_identical_cells_share_one_factor() {
        let counts = CountMatrix::from_array(Array2::from_shape_fn((50, 25), |(g, _)| (g + 1) as f64)).unwrap();
        let labels = ClusterLabels::single(25).unwrap();
        let est = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap();

        for pf in &est.pooled_factors {
            assert_relative_eq!(pf.factor / pf.pool.len() as f64, 1.0, max_relative = 1e-12);
        }
        for sf in &est.size_factors {
            assert_relative_eq!(sf.unwrap(), 1.0, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_reruns_are_bit_identical() {
        let (counts, labels) = noisy_two_types();
        let params = DeconvolutionParams::default();
        let first = compute_sum_factors(&counts, &labels, &params).unwrap();
        let second = compute_sum_factors(&counts, &labels, &params).unwrap();
        let threaded = compute_sum_factors(
            &counts,
            &labels,
            &DeconvolutionParams {
                n_threads: Some(3),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(first.raw_factors, second.raw_factors);
        assert_eq!(first.raw_factors, threaded.raw_factors);
        assert_eq!(first.pooled_factors, threaded.pooled_factors);
    }

    #[test]
    fn test_scaling_a_cell_scales_its_factor() {
        let counts = varied_depth(30);
        let labels = ClusterLabels::single(30).unwrap();
        let params = DeconvolutionParams::default();
        let before = compute_sum_factors(&counts, &labels, &params).unwrap();

        let mut scaled = counts.counts().to_owned();
        scaled.column_mut(5).mapv_inplace(|x| x * 3.0);
        let scaled = CountMatrix::from_array(scaled).unwrap();
        let after = compute_sum_factors(&scaled, &labels, &params).unwrap();

        let ratio = after.raw_factors[5].unwrap() / before.raw_factors[5].unwrap();
        assert!((ratio - 3.0).abs() < 0.3, "ratio {}", ratio);
        assert_relative_eq!(
            after.raw_factors[0].unwrap(),
            before.raw_factors[0].unwrap(),
            max_relative = 0.1
        );
    }

    fn assert_tracks_library_size(counts: &CountMatrix, est: &SizeFactorEstimate) {
        assert!(est.is_complete(), "flagged {:?}", est.flagged_cells());
        assert!(est.failures.is_empty());
        let sf = est.size_factors_array().unwrap();
        assert_abs_diff_eq!(sf.mean().unwrap(), 1.0, epsilon = 1e-9);

        let libs = counts.library_sizes();
        for (c, raw) in est.raw_factors.iter().enumerate() {
            assert_relative_eq!(raw.unwrap() / est.raw_factors[0].unwrap(), libs[c] / libs[0], max_relative = 1e-4);
        }
    }

    #[test]
    fn test_default_params_resolve_small_single_clusters() {
        init_logger();
        for n_cells in [10, 20, 21] {
            let counts = varied_depth(n_cells);
            let labels = ClusterLabels::single(n_cells).unwrap();
            let est = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap();
            assert_tracks_library_size(&counts, &est);
        }
    }

    #[test]
    fn test_default_params_resolve_two_small_clusters() {
        // Two 15-cell types, each internally identical up to depth
        let data = Array2::from_shape_fn((200, 30), |(g, c)| {
            let depth = 1.0 + (c % 7) as f64;
            let level = if c < 15 { 1 + g % 11 } else { 1 + (g * 7) % 13 };
            depth * level as f64
        });
        let counts = CountMatrix::from_array(data).unwrap();
        let labels = ClusterLabels::new((0..30).map(|c| usize::from(c >= 15)).collect()).unwrap();
        let est = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap();

        assert!(est.is_complete(), "flagged {:?}", est.flagged_cells());
        assert!(est.failures.is_empty());
        assert_abs_diff_eq!(est.size_factors_array().unwrap().mean().unwrap(), 1.0, epsilon = 1e-9);
        let raw: Vec<f64> = est.raw_factors.iter().map(|f| f.unwrap()).collect();
        for c in 0..30 {
            let first = if c < 15 { 0 } else { 15 };
            let depth_ratio = (1.0 + (c % 7) as f64) / (1.0 + (first % 7) as f64);
            // Bridge rows are not exactly consistent across types
            assert_relative_eq!(raw[c] / raw[first], depth_ratio, max_relative = 0.1);
        }
    }

    #[test]
    fn test_default_params_resolve_uneven_clusters() {
        let counts = varied_depth(51);
        let labels = ClusterLabels::new((0..51).map(|c| usize::from(c >= 21)).collect()).unwrap();
        let est = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap();
        assert_tracks_library_size(&counts, &est);
    }

    #[test]
    fn test_singular_cluster_flagged_others_proceed() {
        let counts = CountMatrix::from_array(Array2::from_shape_fn((20, 9), |(g, c)| ((g + 1) * (c + 1)) as f64)).unwrap();
        let labels = ClusterLabels::new(vec![0, 0, 0, 0, 1, 1, 1, 1, 1]).unwrap();
        let params = DeconvolutionParams {
            min_pool_size: Some(2),
            max_pool_size: 2,
            pool_size_step: 1,
            ..Default::default()
        };
        let est = compute_sum_factors(&counts, &labels, &params).unwrap();

        assert_eq!(est.failures.len(), 1);
        assert_eq!(est.failures[0].kind, FailureKind::SingularSystem);
        assert_eq!(est.failures[0].cells, vec![0, 1, 2, 3]);
        assert_eq!(est.flagged_cells(), vec![0, 1, 2, 3]);

        let estimated: Vec<f64> = est.size_factors[4..].iter().map(|f| f.unwrap()).collect();
        assert_abs_diff_eq!(estimated.iter().sum::<f64>() / 5.0, 1.0, epsilon = 1e-9);
        for (i, raw) in est.raw_factors[4..].iter().enumerate() {
            let lib = counts.library_sizes()[4 + i];
            assert_relative_eq!(raw.unwrap(), lib, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_anchor_rows_rescue_singular_cluster() {
        let counts = CountMatrix::from_array(Array2::from_shape_fn((20, 4), |(g, c)| ((g + 1) * (c + 1)) as f64)).unwrap();
        let labels = ClusterLabels::single(4).unwrap();
        let params = DeconvolutionParams {
            min_pool_size: Some(2),
            max_pool_size: 2,
            pool_size_step: 1,
            anchor_weight: 0.1,
            ..Default::default()
        };
        let est = compute_sum_factors(&counts, &labels, &params).unwrap();
        assert!(est.is_complete());
        let sf = est.size_factors_array().unwrap();
        assert_abs_diff_eq!(sf.mean().unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_small_cluster_merged_before_pooling() {
        let (counts, _) = noisy_two_types();
        // Cells 57..60 form their own tiny cluster of the second type
        let labels: Vec<usize> = (0..60)
            .map(|c| match c {
                0..=29 => 0,
                30..=56 => 1,
                _ => 2,
            })
            .collect();
        let labels = ClusterLabels::new(labels).unwrap();
        let est = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap();

        assert!(est.failures.is_empty());
        assert!(est.is_complete());
        assert!(est
            .pooled_factors
            .iter()
            .any(|f| f.pool.members.contains(&58) && f.pool.members.contains(&40)));
    }

    #[test]
    fn test_zero_time_limit_times_out() {
        let (counts, labels) = doubled_clusters();
        let params = DeconvolutionParams {
            time_limit: Some(Duration::ZERO),
            ..Default::default()
        };
        let result = compute_sum_factors(&counts, &labels, &params);
        assert!(matches!(result, Err(ScnormError::Timeout { .. })));
    }

    #[test]
    fn test_dense_solver_matches_sparse() {
        let (counts, labels) = doubled_clusters();
        let sparse = compute_sum_factors(&counts, &labels, &DeconvolutionParams::default()).unwrap();
        let dense = compute_sum_factors(
            &counts,
            &labels,
            &DeconvolutionParams {
                solver: LinearSolver::dense(),
                ..Default::default()
            },
        )
        .unwrap();

        for (d, s) in dense.size_factors.iter().zip(sparse.size_factors.iter()) {
            assert_relative_eq!(d.unwrap(), s.unwrap(), max_relative = 1e-5);
        }
    }

    #[test]
    fn test_with_assigner_uses_seed() {
        let (counts, _) = noisy_two_types();
        let assigner = KMeansClusters::new(KMeansParams {
            n_clusters: 2,
            ..Default::default()
        });
        let params = DeconvolutionParams {
            random_seed: 7,
            ..Default::default()
        };
        let a = compute_sum_factors_with(&counts, &assigner, &params).unwrap();
        let b = compute_sum_factors_with(&counts, &assigner, &params).unwrap();
        assert_eq!(a.raw_factors, b.raw_factors);

        let fixed = FixedClusters(ClusterLabels::single(60).unwrap());
        let single = compute_sum_factors_with(&counts, &fixed, &params).unwrap();
        assert_eq!(single.n_cells(), 60);
    }

    #[test]
    fn test_params_json_round_trip() {
        let params = DeconvolutionParams {
            min_pool_size: Some(11),
            trim_fraction: 0.1,
            solver: LinearSolver::dense(),
            time_limit: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(DeconvolutionParams::from_json_str(&json).unwrap(), params);

        let partial = DeconvolutionParams::from_json_str(r#"{"pool_step": 3, "solver": {"kind": "sparse_cgls", "max_iter": 50, "tolerance": 1e-8}}"#).unwrap();
        assert_eq!(partial.pool_step, 3);
        assert_eq!(partial.max_pool_size, 101);
        assert_eq!(
            partial.solver,
            LinearSolver::SparseCgls {
                max_iter: 50,
                tolerance: 1e-8
            }
        );

        assert!(matches!(
            DeconvolutionParams::from_json_str("{\"pool_step\": \"x\"}"),
            Err(ScnormError::Config(_))
        ));
        assert!(DeconvolutionParams::from_json_str("{\"trim_fraction\": 0.7}")
            .unwrap_err()
            .is_invalid_input());
    }
}
