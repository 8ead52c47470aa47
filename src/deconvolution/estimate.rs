//! Result of a deconvolution run

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::solver::PooledFactor;
use crate::error::{Result, ScnormError};
use crate::normalization::center_size_factors;
use crate::stats::median;

/// Why a group of cells received no size factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Too few cells to form a pool, even after merging
    InsufficientData,
    /// The pools do not determine the cells' factors uniquely
    SingularSystem,
    /// The solve produced a zero, negative, or non-finite factor
    NonPositiveFactors,
}

/// Cells left without a factor, reported instead of a silent default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFailure {
    /// Input cluster ids the cells came from
    pub clusters: Vec<usize>,
    /// Affected cell indices, ascending
    pub cells: Vec<usize>,
    pub kind: FailureKind,
    pub reason: String,
}

/// Per-cell size factors from pooled deconvolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeFactorEstimate {
    /// Solved factors on the library-size scale, before centering
    pub raw_factors: Vec<Option<f64>>,
    /// Raw factors divided by their mean over estimated cells
    pub size_factors: Vec<Option<f64>>,
    pub failures: Vec<ClusterFailure>,
    /// Every pool that entered a solve, with its factor
    pub pooled_factors: Vec<PooledFactor>,
}

impl SizeFactorEstimate {
    /// Assemble from raw factors, centering over the cells that have one
    pub(crate) fn from_raw(
        raw_factors: Vec<Option<f64>>,
        mut failures: Vec<ClusterFailure>,
        pooled_factors: Vec<PooledFactor>,
    ) -> Result<Self> {
        let estimated: Vec<f64> = raw_factors.iter().flatten().copied().collect();
        let size_factors = if estimated.is_empty() {
            vec![None; raw_factors.len()]
        } else {
            let mut centered = center_size_factors(&estimated)?.to_vec().into_iter();
            raw_factors.iter().map(|raw| raw.and_then(|_| centered.next())).collect()
        };
        failures.sort_by_key(|f| f.cells.first().copied());

        Ok(Self {
            raw_factors,
            size_factors,
            failures,
            pooled_factors,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.raw_factors.len()
    }

    /// True when every cell received a factor
    pub fn is_complete(&self) -> bool {
        self.size_factors.iter().all(Option::is_some)
    }

    /// Centered factors, only when no cell failed
    pub fn size_factors_array(&self) -> Option<Array1<f64>> {
        self.size_factors.iter().copied().collect::<Option<Vec<f64>>>().map(Array1::from)
    }

    /// Cells without a factor, ascending
    pub fn flagged_cells(&self) -> Vec<usize> {
        self.size_factors
            .iter()
            .enumerate()
            .filter(|(_, sf)| sf.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Complete factor vector, using `fallback` for flagged cells.
    ///
    /// The fallback is rescaled onto the deconvolved scale by the median
    /// ratio over cells present in both, then the combined vector is
    /// centered to mean 1.
    pub fn with_fallback(&self, fallback: &Array1<f64>) -> Result<Array1<f64>> {
        if fallback.len() != self.n_cells() {
            return Err(ScnormError::DimensionMismatch {
                expected: format!("{} fallback factors", self.n_cells()),
                got: format!("{} fallback factors", fallback.len()),
            });
        }

        let ratios: Vec<f64> = self
            .size_factors
            .iter()
            .zip(fallback.iter())
            .filter_map(|(sf, &fb)| sf.map(|s| s / fb))
            .collect();
        let scale = median(&ratios).unwrap_or(1.0);
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ScnormError::InvalidInput {
                reason: format!("Fallback factors give rescaling constant {}", scale),
            });
        }

        let flagged = self.flagged_cells().len();
        if flagged > 0 {
            log::info!("Filling {} cells from fallback factors (scale {:.4})", flagged, scale);
        }

        let combined: Vec<f64> = self
            .size_factors
            .iter()
            .zip(fallback.iter())
            .map(|(sf, &fb)| sf.unwrap_or(fb * scale))
            .collect();
        center_size_factors(&combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn partial() -> SizeFactorEstimate {
        let failure = ClusterFailure {
            clusters: vec![1],
            cells: vec![2],
            kind: FailureKind::SingularSystem,
            reason: "test".to_string(),
        };
        SizeFactorEstimate::from_raw(vec![Some(100.0), Some(300.0), None], vec![failure], Vec::new()).unwrap()
    }

    #[test]
    fn test_centering_skips_flagged_cells() {
        let est = partial();
        assert_eq!(est.size_factors[0], Some(0.5));
        assert_eq!(est.size_factors[1], Some(1.5));
        assert_eq!(est.size_factors[2], None);
        assert!(!est.is_complete());
        assert!(est.size_factors_array().is_none());
        assert_eq!(est.flagged_cells(), vec![2]);
    }

    #[test]
    fn test_fallback_rescaled_and_centered() {
        let est = partial();
        // Fallback is exactly half the deconvolved scale
        let filled = est.with_fallback(&array![0.25, 0.75, 0.5]).unwrap();
        assert_abs_diff_eq!(filled.sum() / 3.0, 1.0, epsilon = 1e-12);
        // 0.5 * 2 = 1.0 before centering, alongside 0.5 and 1.5
        assert_abs_diff_eq!(filled[2] / filled[0], 2.0, epsilon = 1e-12);

        assert!(matches!(
            est.with_fallback(&array![1.0, 1.0]),
            Err(ScnormError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_complete_estimate() {
        let est = SizeFactorEstimate::from_raw(vec![Some(2.0), Some(4.0)], Vec::new(), Vec::new()).unwrap();
        assert!(est.is_complete());
        let sf = est.size_factors_array().unwrap();
        assert_abs_diff_eq!(sf[0], 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sf[1], 4.0 / 3.0, epsilon = 1e-12);
        assert!(est.flagged_cells().is_empty());
    }
}
