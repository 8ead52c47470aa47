//! Construction of overlapping cell pools
//!
//! Cells of each working cluster are arranged on a ring ordered by library
//! size, and pools are sliding windows of several sizes around that ring.
//! Adjacent windows share all but a few cells, which makes the membership
//! system over-determined. Bridge pools mix cells from two clusters so the
//! clusters are tied together in a single solve.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::{ClusterFailure, DeconvolutionParams, FailureKind};
use crate::data::ClusterLabels;

/// Where a pool came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    /// Sliding window of `size` consecutive ring cells within one cluster
    Window { size: usize },
    /// Cells from two neighbouring clusters
    Bridge,
}

/// A set of cells whose counts are summed before estimating a factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Cell indices into the count matrix, in ring order
    pub members: Vec<usize>,
    /// Working clusters the members were drawn from
    pub clusters: Vec<usize>,
    pub kind: PoolKind,
}

impl Pool {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Group of cells pooled together: one input cluster, several merged
/// small clusters, or one piece of a split large cluster
#[derive(Debug, Clone)]
pub(crate) struct WorkingCluster {
    /// Input cluster ids contributing cells
    pub labels: Vec<usize>,
    /// Cell indices, ascending
    pub cells: Vec<usize>,
}

/// Smallest pool size used when the caller does not set one
pub const DEFAULT_MIN_POOL_SIZE: usize = 21;

/// Minimum pool size for this input: the configured value, or the default
/// capped by the largest cluster and by the largest allowed pool
pub(crate) fn effective_min_pool_size(params: &DeconvolutionParams, clusters: &ClusterLabels) -> usize {
    match params.min_pool_size {
        Some(m) => m,
        None => {
            let largest = clusters.cluster_sizes().into_iter().max().unwrap_or(0);
            DEFAULT_MIN_POOL_SIZE
                .min(largest)
                .min(params.max_pool_size)
                .max(2)
        }
    }
}

/// Average profile of a set of cells on the `log2(1 + x)` scale,
/// with proportions scaled back to the mean library size
fn log_profile(profiles: ArrayView2<f64>, cells: &[usize], mean_lib: f64) -> Array1<f64> {
    let mut sum = Array1::<f64>::zeros(profiles.ncols());
    for &c in cells {
        sum += &profiles.row(c);
    }
    let n = cells.len().max(1) as f64;
    sum.mapv(|x| (x / n * mean_lib).ln_1p() / std::f64::consts::LN_2)
}

fn euclidean(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// Split `cells` into `n_pieces` groups by dealing them round-robin along
/// the library-size ranking, so every piece spans the full depth range
fn split_by_rank(cells: &[usize], lib_sizes: &[f64], n_pieces: usize) -> Vec<Vec<usize>> {
    let ranked = rank_by_library_size(cells, lib_sizes);
    let mut pieces = vec![Vec::new(); n_pieces];
    for (i, cell) in ranked.into_iter().enumerate() {
        pieces[i % n_pieces].push(cell);
    }
    for piece in pieces.iter_mut() {
        piece.sort_unstable();
    }
    pieces
}

/// Form working clusters from the input labels.
///
/// Clusters smaller than `min_size` are merged into their nearest neighbour
/// by average profile, smallest first. If a lone cluster is still too small
/// its cells are reported as `InsufficientData`. Clusters larger than
/// `max_cluster_size` are split.
pub(crate) fn working_clusters(
    clusters: &ClusterLabels,
    lib_sizes: &[f64],
    profiles: ArrayView2<f64>,
    mean_lib: f64,
    min_size: usize,
    max_cluster_size: usize,
) -> (Vec<WorkingCluster>, Vec<ClusterFailure>) {
    let mut working: Vec<WorkingCluster> = clusters
        .groups()
        .into_iter()
        .enumerate()
        .map(|(label, cells)| WorkingCluster {
            labels: vec![label],
            cells,
        })
        .collect();
    let mut centroids: Vec<Array1<f64>> = working
        .iter()
        .map(|wc| log_profile(profiles, &wc.cells, mean_lib))
        .collect();

    while working.len() > 1 {
        let smallest = working
            .iter()
            .enumerate()
            .filter(|(_, wc)| wc.cells.len() < min_size)
            .min_by_key(|(idx, wc)| (wc.cells.len(), *idx))
            .map(|(idx, _)| idx);
        let Some(small) = smallest else { break };

        let nearest = (0..working.len())
            .filter(|&k| k != small)
            .min_by(|&a, &b| {
                euclidean(&centroids[small], &centroids[a])
                    .total_cmp(&euclidean(&centroids[small], &centroids[b]))
                    .then(a.cmp(&b))
            });
        let Some(target) = nearest else { break };

        let absorbed = working.remove(small);
        centroids.remove(small);
        let target = if target > small { target - 1 } else { target };

        log::warn!(
            "Cluster(s) {:?} with {} cells are smaller than the minimum pool size {}; merged into cluster(s) {:?}",
            absorbed.labels,
            absorbed.cells.len(),
            min_size,
            working[target].labels
        );

        let merged = &mut working[target];
        merged.labels.extend(absorbed.labels);
        merged.labels.sort_unstable();
        merged.cells.extend(absorbed.cells);
        merged.cells.sort_unstable();
        centroids[target] = log_profile(profiles, &merged.cells, mean_lib);
    }

    let mut failures = Vec::new();
    working.retain(|wc| {
        if wc.cells.len() < min_size {
            log::warn!(
                "Only {} cells available in cluster(s) {:?}; at least {} are needed for pooling",
                wc.cells.len(),
                wc.labels,
                min_size
            );
            failures.push(ClusterFailure {
                clusters: wc.labels.clone(),
                cells: wc.cells.clone(),
                kind: FailureKind::InsufficientData,
                reason: format!("{} cells, minimum pool size is {}", wc.cells.len(), min_size),
            });
            false
        } else {
            true
        }
    });

    let mut result = Vec::with_capacity(working.len());
    for wc in working {
        if wc.cells.len() > max_cluster_size {
            let n_pieces = wc.cells.len().div_ceil(max_cluster_size);
            log::info!(
                "Splitting cluster(s) {:?} of {} cells into {} pieces",
                wc.labels,
                wc.cells.len(),
                n_pieces
            );
            for cells in split_by_rank(&wc.cells, lib_sizes, n_pieces) {
                result.push(WorkingCluster {
                    labels: wc.labels.clone(),
                    cells,
                });
            }
        } else {
            result.push(wc);
        }
    }

    (result, failures)
}

/// Cells sorted by library size ascending, ties broken by index
pub(crate) fn rank_by_library_size(cells: &[usize], lib_sizes: &[f64]) -> Vec<usize> {
    let mut ranked = cells.to_vec();
    ranked.sort_by(|&a, &b| lib_sizes[a].total_cmp(&lib_sizes[b]).then(a.cmp(&b)));
    ranked
}

/// Builds pools for working clusters
pub(crate) struct PoolBuilder<'a> {
    lib_sizes: &'a [f64],
    min_size: usize,
    max_size: usize,
    size_step: usize,
    stride: usize,
    bridge_pools: usize,
    /// Window sizes adapt to each cluster instead of starting at `min_size`
    auto_sizes: bool,
}

impl<'a> PoolBuilder<'a> {
    pub fn new(lib_sizes: &'a [f64], min_size: usize, params: &DeconvolutionParams) -> Self {
        Self {
            lib_sizes,
            min_size,
            max_size: params.max_pool_size,
            size_step: params.pool_size_step,
            stride: params.pool_step,
            bridge_pools: params.bridge_pools,
            auto_sizes: params.min_pool_size.is_none(),
        }
    }

    /// Ring order: even ranks ascending, then odd ranks descending.
    /// Neighbours on the ring have similar library sizes, including
    /// across the wrap-around point.
    pub fn ring(&self, cells: &[usize]) -> Vec<usize> {
        let ranked = rank_by_library_size(cells, self.lib_sizes);
        let evens = ranked.iter().step_by(2).copied();
        let odds: Vec<usize> = ranked.iter().skip(1).step_by(2).copied().collect();
        evens.chain(odds.into_iter().rev()).collect()
    }

    /// Window sizes for a cluster of `n` cells.
    ///
    /// With an explicit minimum the ladder runs from it to `min(max, n)`.
    /// Otherwise it runs from `min(21, n / 2)` to `n - 1` (capped by the
    /// maximum), and a size coprime with `n` is added when the ladder has
    /// none, so the complete ring of windows always has full rank.
    pub fn window_sizes(&self, n: usize) -> Vec<usize> {
        if !self.auto_sizes {
            let upper = self.max_size.min(n);
            let lower = self.min_size.min(upper);
            return (lower..=upper).step_by(self.size_step).collect();
        }
        if n < 2 {
            return vec![n];
        }

        let upper = self.max_size.min(n - 1).max(1);
        let lower = DEFAULT_MIN_POOL_SIZE.min(n / 2).max(2).min(upper);
        let mut sizes: Vec<usize> = (lower..=upper).step_by(self.size_step).collect();
        if !sizes.iter().any(|&w| gcd(w, n) == 1) {
            // Largest coprime size that fits; 1 always qualifies
            if let Some(w) = (1..=upper).rev().find(|&w| gcd(w, n) == 1) {
                sizes.push(w);
                sizes.sort_unstable();
                sizes.dedup();
            }
        }
        sizes
    }

    /// Sliding windows of every size around the ring of working cluster `cluster`
    pub fn window_pools(&self, cluster: usize, ring: &[usize]) -> Vec<Pool> {
        let n = ring.len();
        if n == 0 {
            return Vec::new();
        }

        let mut pools = Vec::new();
        for size in self.window_sizes(n) {
            for start in (0..n).step_by(self.stride) {
                let members = (0..size).map(|k| ring[(start + k) % n]).collect();
                pools.push(Pool {
                    members,
                    clusters: vec![cluster],
                    kind: PoolKind::Window { size },
                });
            }
        }
        pools
    }

    /// Number of window pools `window_pools` builds for a ring of `n` cells
    pub fn expected_window_count(&self, n: usize) -> usize {
        self.window_sizes(n).len() * n.div_ceil(self.stride)
    }

    /// Pools of `ceil(min_size / 2)` consecutive ring cells from each of two
    /// clusters, at evenly spaced offsets around both rings
    pub fn bridge_pools(&self, a: (usize, &[usize]), b: (usize, &[usize])) -> Vec<Pool> {
        let (cluster_a, ring_a) = a;
        let (cluster_b, ring_b) = b;
        if ring_a.is_empty() || ring_b.is_empty() {
            return Vec::new();
        }

        let half = self.min_size.div_ceil(2).min(ring_a.len()).min(ring_b.len());
        (0..self.bridge_pools)
            .map(|t| {
                let offset_a = t * ring_a.len() / self.bridge_pools;
                let offset_b = t * ring_b.len() / self.bridge_pools;
                let members = (0..half)
                    .map(|k| ring_a[(offset_a + k) % ring_a.len()])
                    .chain((0..half).map(|k| ring_b[(offset_b + k) % ring_b.len()]))
                    .collect();
                Pool {
                    members,
                    clusters: vec![cluster_a, cluster_b],
                    kind: PoolKind::Bridge,
                }
            })
            .collect()
    }
}

/// Full column rank of the complete set of stride-one windows on a ring.
///
/// The Gram matrix of such windows is circulant, with eigenvalue
/// `sum_w |sum_{k<w} e^{2πi jk/n}|^2` at frequency `j`. A window of size `w`
/// vanishes at `j` exactly when `n` divides `j * w`, so the system is
/// singular iff some `j` in `1..n` is a common zero of every size.
pub(crate) fn ring_windows_full_rank(n: usize, sizes: &[usize]) -> bool {
    if sizes.is_empty() {
        return n == 0;
    }
    !(1..n).any(|j| sizes.iter().all(|&w| (j * w) % n == 0))
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Gram matrix `A^T A` of pool membership restricted to `cells`
pub(crate) fn membership_gram(cells: &[usize], pools: &[&Pool]) -> Array2<f64> {
    let n = cells.len();
    let position = |cell: usize| cells.binary_search(&cell).ok();
    let mut gram = Array2::<f64>::zeros((n, n));
    for pool in pools {
        let local: Vec<usize> = pool.members.iter().filter_map(|&c| position(c)).collect();
        for &a in &local {
            for &b in &local {
                gram[[a, b]] += 1.0;
            }
        }
    }
    gram
}
