//! Simple per-cell size factors and mean centering

use ndarray::Array1;

use crate::data::CountMatrix;
use crate::error::{Result, ScnormError};

/// Rescale raw per-cell factors so that their mean is exactly one.
///
/// Every factor must be strictly positive and finite; the result has the
/// same length as the input.
pub fn center_size_factors(raw: &[f64]) -> Result<Array1<f64>> {
    if raw.is_empty() {
        return Err(ScnormError::InsufficientData {
            reason: "No size factors to center".to_string(),
        });
    }

    if let Some((idx, &bad)) = raw.iter().enumerate().find(|(_, &x)| x <= 0.0 || !x.is_finite()) {
        return Err(ScnormError::InvalidInput {
            reason: format!("Size factor {} for cell {} is not strictly positive", bad, idx),
        });
    }

    let mean = raw.iter().sum::<f64>() / raw.len() as f64;
    Ok(raw.iter().map(|&x| x / mean).collect())
}

/// Library size factors: total counts per cell, centered to mean one.
///
/// Cells with no counts have no defined factor and are rejected.
pub fn library_size_factors(counts: &CountMatrix) -> Result<Array1<f64>> {
    let lib_sizes = counts.library_sizes().to_vec();

    if let Some(idx) = lib_sizes.iter().position(|&s| s <= 0.0) {
        return Err(ScnormError::InvalidInput {
            reason: format!("Cell '{}' has a library size of zero", counts.cell_ids()[idx]),
        });
    }

    center_size_factors(&lib_sizes)
}

/// Spike-in size factors: total spike-in counts per cell, centered to mean one.
///
/// `spike_in_genes` are row indices of the exogenous transcripts. Endogenous
/// genes do not contribute, so differences in total RNA content between cells
/// are preserved after scaling.
pub fn spike_in_size_factors(counts: &CountMatrix, spike_in_genes: &[usize]) -> Result<Array1<f64>> {
    if spike_in_genes.is_empty() {
        return Err(ScnormError::InvalidInput {
            reason: "No spike-in genes given".to_string(),
        });
    }
    if let Some(&bad) = spike_in_genes.iter().find(|&&g| g >= counts.n_genes()) {
        return Err(ScnormError::InvalidInput {
            reason: format!("Spike-in gene index {} out of range for {} genes", bad, counts.n_genes()),
        });
    }

    let totals: Vec<f64> = (0..counts.n_cells())
        .map(|j| {
            let cell = counts.cell_counts(j);
            spike_in_genes.iter().map(|&g| cell[g]).sum()
        })
        .collect();

    if let Some(idx) = totals.iter().position(|&t| t <= 0.0) {
        return Err(ScnormError::InvalidInput {
            reason: format!("Cell '{}' has no spike-in counts", counts.cell_ids()[idx]),
        });
    }

    log::debug!(
        "Spike-in totals from {} transcripts: min {:.1}, max {:.1}",
        spike_in_genes.len(),
        totals.iter().copied().fold(f64::INFINITY, f64::min),
        totals.iter().copied().fold(0.0, f64::max)
    );

    center_size_factors(&totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_center_size_factors() {
        let centered = center_size_factors(&[1.0, 2.0, 3.0]).unwrap();
        assert_abs_diff_eq!(centered.mean().unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(centered[2] / centered[0], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_center_rejects_bad_factors() {
        assert!(matches!(
            center_size_factors(&[]),
            Err(ScnormError::InsufficientData { .. })
        ));
        assert!(matches!(
            center_size_factors(&[1.0, 0.0]),
            Err(ScnormError::InvalidInput { .. })
        ));
        assert!(center_size_factors(&[1.0, f64::NAN]).is_err());
    }

    #[test]
    fn test_library_size_factors() {
        let counts = CountMatrix::from_array(array![[10.0, 30.0], [10.0, 30.0]]).unwrap();
        let sf = library_size_factors(&counts).unwrap();
        assert_abs_diff_eq!(sf[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(sf[1], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_library_size_factors_zero_cell() {
        let counts = CountMatrix::from_array(array![[10.0, 0.0], [10.0, 0.0]]).unwrap();
        assert!(library_size_factors(&counts).unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_spike_in_factors_ignore_endogenous() {
        // Cell 1 has four times the endogenous RNA but the same spike-in amount
        let counts = CountMatrix::from_array(array![
            [100.0, 400.0],
            [50.0, 200.0],
            [20.0, 20.0],
            [10.0, 10.0],
        ])
        .unwrap();
        let sf = spike_in_size_factors(&counts, &[2, 3]).unwrap();
        assert_abs_diff_eq!(sf[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sf[1], 1.0, epsilon = 1e-12);

        assert!(spike_in_size_factors(&counts, &[7]).is_err());
        assert!(spike_in_size_factors(&counts, &[]).is_err());
    }
}
