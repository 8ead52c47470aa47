//! Least-squares solvers for the pool membership system
//!
//! The system has one row per pool and one column per cell, with a one
//! wherever the cell belongs to the pool. It is over-determined and very
//! sparse, so two strategies are offered: a dense Householder QR for small
//! problems, and conjugate gradients on the normal equations over a sparse
//! matrix for everything else.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use super::deadline::Deadline;
use crate::error::{Result, ScnormError};

/// Sparse over-determined system `A x ≈ b`
#[derive(Debug, Clone)]
pub struct LinearSystem {
    matrix: CsMat<f64>,
    rhs: Array1<f64>,
}

impl LinearSystem {
    /// Build from `(row, col, value)` entries; repeated entries are summed
    pub fn from_triplets(n_rows: usize, n_cols: usize, triplets: &[(usize, usize, f64)], rhs: Array1<f64>) -> Result<Self> {
        if rhs.len() != n_rows {
            return Err(ScnormError::DimensionMismatch {
                expected: format!("{} right-hand side values", n_rows),
                got: format!("{} right-hand side values", rhs.len()),
            });
        }

        let mut tri = TriMat::with_capacity((n_rows, n_cols), triplets.len());
        for &(row, col, value) in triplets {
            if row >= n_rows || col >= n_cols {
                return Err(ScnormError::InvalidInput {
                    reason: format!("Entry ({}, {}) outside a {}x{} system", row, col, n_rows, n_cols),
                });
            }
            tri.add_triplet(row, col, value);
        }
        let matrix: CsMat<f64> = tri.to_csr();

        Ok(Self { matrix, rhs })
    }

    pub fn n_rows(&self) -> usize {
        self.matrix.rows()
    }

    pub fn n_cols(&self) -> usize {
        self.matrix.cols()
    }

    pub fn rhs(&self) -> &Array1<f64> {
        &self.rhs
    }

    /// `A x`
    pub fn mul_vec(&self, x: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.n_rows());
        for (row, vec) in self.matrix.outer_iterator().enumerate() {
            out[row] = vec.iter().map(|(col, &val)| val * x[col]).sum();
        }
        out
    }

    /// `A^T r`
    pub fn mul_transpose_vec(&self, r: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.n_cols());
        for (row, vec) in self.matrix.outer_iterator().enumerate() {
            let r_row = r[row];
            for (col, &val) in vec.iter() {
                out[col] += val * r_row;
            }
        }
        out
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n_rows(), self.n_cols()));
        for (row, vec) in self.matrix.outer_iterator().enumerate() {
            for (col, &val) in vec.iter() {
                dense[[row, col]] += val;
            }
        }
        dense
    }

    /// Columns with no non-zero entry
    fn empty_columns(&self) -> Vec<usize> {
        let mut seen = vec![false; self.n_cols()];
        for vec in self.matrix.outer_iterator() {
            for (col, &val) in vec.iter() {
                if val != 0.0 {
                    seen[col] = true;
                }
            }
        }
        seen.iter().enumerate().filter(|(_, &s)| !s).map(|(c, _)| c).collect()
    }
}

/// Least-squares strategy, chosen by configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinearSolver {
    /// Householder QR with column pivoting on the dense system.
    /// Memory grows with pools x cells; intended for small inputs.
    DenseQr {
        /// Relative threshold on `|R_ii|` below which a column counts as dependent
        rank_tolerance: f64,
    },
    /// Conjugate gradients on the normal equations (CGLS) over the sparse system
    SparseCgls { max_iter: usize, tolerance: f64 },
}

impl Default for LinearSolver {
    fn default() -> Self {
        LinearSolver::SparseCgls {
            max_iter: 10_000,
            tolerance: 1e-10,
        }
    }
}

impl LinearSolver {
    pub fn dense() -> Self {
        LinearSolver::DenseQr { rank_tolerance: 1e-10 }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LinearSolver::DenseQr { .. } => "dense QR",
            LinearSolver::SparseCgls { .. } => "sparse CGLS",
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match *self {
            LinearSolver::DenseQr { rank_tolerance } if !(rank_tolerance > 0.0 && rank_tolerance < 1.0) => {
                Err(ScnormError::InvalidInput {
                    reason: format!("rank_tolerance must be in (0, 1), got {}", rank_tolerance),
                })
            }
            LinearSolver::SparseCgls { max_iter, .. } if max_iter == 0 => Err(ScnormError::InvalidInput {
                reason: "max_iter must be at least 1".to_string(),
            }),
            LinearSolver::SparseCgls { tolerance, .. } if !(tolerance > 0.0) => Err(ScnormError::InvalidInput {
                reason: format!("tolerance must be positive, got {}", tolerance),
            }),
            _ => Ok(()),
        }
    }

    /// Minimize `||A x - b||`.
    ///
    /// Returns `SingularSystem` when no unique minimizer exists and
    /// `Timeout` when the deadline passes mid-solve.
    pub fn solve(&self, system: &LinearSystem, deadline: &Deadline) -> Result<Array1<f64>> {
        if system.n_cols() == 0 {
            return Ok(Array1::zeros(0));
        }
        if system.n_rows() < system.n_cols() {
            return Err(ScnormError::SingularSystem {
                reason: format!(
                    "{} equations cannot determine {} unknowns",
                    system.n_rows(),
                    system.n_cols()
                ),
            });
        }
        let empty = system.empty_columns();
        if !empty.is_empty() {
            return Err(ScnormError::SingularSystem {
                reason: format!("{} unknowns appear in no equation", empty.len()),
            });
        }

        match *self {
            LinearSolver::DenseQr { rank_tolerance } => {
                dense_least_squares(&system.to_dense(), system.rhs(), rank_tolerance, deadline)
            }
            LinearSolver::SparseCgls { max_iter, tolerance } => cgls(system, max_iter, tolerance, deadline),
        }
    }
}

/// Result of an in-place Householder QR with column pivoting
struct PivotedQr {
    /// R on and above the diagonal, Householder vectors below
    r: Array2<f64>,
    /// `piv[k]` is the original column now at position `k`
    piv: Vec<usize>,
    /// Diagonal entries of R processed before the remaining block vanished
    steps: usize,
}

/// Factorize `matrix` in place, applying every reflection to `rhs` as well
fn pivoted_qr(mut r: Array2<f64>, mut rhs: Option<&mut Array1<f64>>, deadline: &Deadline) -> Result<PivotedQr> {
    let nrow = r.nrows();
    let ncol = r.ncols();
    let k = nrow.min(ncol);

    // Squared column norms of the trailing block, for pivoting
    let mut col_norms_sq: Vec<f64> = (0..ncol).map(|j| r.column(j).iter().map(|&v| v * v).sum()).collect();
    let mut piv: Vec<usize> = (0..ncol).collect();
    let mut steps = 0;

    for step in 0..k {
        deadline.check("QR factorization")?;

        let mut best_col = step;
        let mut best_norm = col_norms_sq[step];
        for (j, &norm) in col_norms_sq.iter().enumerate().skip(step + 1) {
            if norm > best_norm {
                best_norm = norm;
                best_col = j;
            }
        }

        if best_col != step {
            for i in 0..nrow {
                r.swap([i, step], [i, best_col]);
            }
            col_norms_sq.swap(step, best_col);
            piv.swap(step, best_col);
        }

        let mut alpha = (step..nrow).map(|i| r[[i, step]] * r[[i, step]]).sum::<f64>().sqrt();
        if alpha < f64::EPSILON * 1e3 {
            break;
        }
        steps += 1;

        // Sign chosen to avoid cancellation
        if r[[step, step]] > 0.0 {
            alpha = -alpha;
        }

        let v0 = r[[step, step]] - alpha;
        r[[step, step]] = alpha;

        // Householder vector v = [v0, r[step+1.., step]]
        let v_norm_sq = v0 * v0 + ((step + 1)..nrow).map(|i| r[[i, step]] * r[[i, step]]).sum::<f64>();
        if v_norm_sq < f64::MIN_POSITIVE {
            continue;
        }
        let tau = 2.0 / v_norm_sq;

        for j in (step + 1)..ncol {
            let dot = v0 * r[[step, j]] + ((step + 1)..nrow).map(|i| r[[i, step]] * r[[i, j]]).sum::<f64>();
            let scale = tau * dot;
            r[[step, j]] -= scale * v0;
            for i in (step + 1)..nrow {
                let vi = r[[i, step]];
                r[[i, j]] -= scale * vi;
            }
        }

        if let Some(b) = rhs.as_deref_mut() {
            let dot = v0 * b[step] + ((step + 1)..nrow).map(|i| r[[i, step]] * b[i]).sum::<f64>();
            let scale = tau * dot;
            b[step] -= scale * v0;
            for i in (step + 1)..nrow {
                b[i] -= scale * r[[i, step]];
            }
        }

        for j in (step + 1)..ncol {
            col_norms_sq[j] = (col_norms_sq[j] - r[[step, j]] * r[[step, j]]).max(0.0);
        }
    }

    Ok(PivotedQr { r, piv, steps })
}

/// Number of diagonal entries of R above `rel_tol * max |R_ii|`
fn rank_from_qr(qr: &PivotedQr, rel_tol: f64) -> usize {
    let max_abs_diag = (0..qr.steps).map(|i| qr.r[[i, i]].abs()).fold(0.0f64, f64::max);
    if max_abs_diag == 0.0 {
        return 0;
    }
    (0..qr.steps).filter(|&i| qr.r[[i, i]].abs() > rel_tol * max_abs_diag).count()
}

/// Numerical rank of a dense matrix via Householder QR with column pivoting.
/// Fails only when `deadline` expires during the factorization.
pub(crate) fn numerical_rank(matrix: &Array2<f64>, rel_tol: f64, deadline: &Deadline) -> Result<usize> {
    if matrix.is_empty() {
        return Ok(0);
    }
    let qr = pivoted_qr(matrix.to_owned(), None, deadline)?;
    Ok(rank_from_qr(&qr, rel_tol))
}

fn dense_least_squares(a: &Array2<f64>, b: &Array1<f64>, rank_tolerance: f64, deadline: &Deadline) -> Result<Array1<f64>> {
    let ncol = a.ncols();
    let mut qt_b = b.to_owned();
    let qr = pivoted_qr(a.to_owned(), Some(&mut qt_b), deadline)?;

    let rank = rank_from_qr(&qr, rank_tolerance);
    if rank < ncol {
        return Err(ScnormError::SingularSystem {
            reason: format!("pool membership matrix has rank {} for {} cells", rank, ncol),
        });
    }

    // Back-substitution on the leading n x n block of R
    let mut z = vec![0.0; ncol];
    for i in (0..ncol).rev() {
        let mut sum = qt_b[i];
        for j in (i + 1)..ncol {
            sum -= qr.r[[i, j]] * z[j];
        }
        z[i] = sum / qr.r[[i, i]];
    }

    let mut x = Array1::zeros(ncol);
    for (k, &col) in qr.piv.iter().enumerate() {
        x[col] = z[k];
    }
    Ok(x)
}

/// Conjugate gradients applied to `A^T A x = A^T b` without forming `A^T A`.
/// Stops once `||A^T r|| <= tolerance * ||A^T b||`.
fn cgls(system: &LinearSystem, max_iter: usize, tolerance: f64, deadline: &Deadline) -> Result<Array1<f64>> {
    let mut x = Array1::<f64>::zeros(system.n_cols());
    let mut r = system.rhs().to_owned();
    let mut s = system.mul_transpose_vec(&r);
    let mut p = s.clone();
    let mut gamma = s.dot(&s);
    let threshold = tolerance * gamma.sqrt();

    if gamma == 0.0 {
        return Ok(x);
    }

    for iter in 0..max_iter {
        deadline.check("sparse least-squares solve")?;

        let q = system.mul_vec(&p);
        let q_norm_sq = q.dot(&q);
        if q_norm_sq <= 0.0 || !q_norm_sq.is_finite() {
            return Err(ScnormError::SingularSystem {
                reason: format!("search direction vanished at iteration {}", iter),
            });
        }

        let alpha = gamma / q_norm_sq;
        x.scaled_add(alpha, &p);
        r.scaled_add(-alpha, &q);
        s = system.mul_transpose_vec(&r);
        let gamma_next = s.dot(&s);

        if gamma_next.sqrt() <= threshold {
            log::debug!("CGLS converged after {} iterations", iter + 1);
            return Ok(x);
        }

        let beta = gamma_next / gamma;
        p.mapv_inplace(|v| v * beta);
        p += &s;
        gamma = gamma_next;
    }

    Err(ScnormError::SingularSystem {
        reason: format!(
            "CGLS did not converge in {} iterations (normal residual {:.3e})",
            max_iter,
            gamma.sqrt()
        ),
    })
}
