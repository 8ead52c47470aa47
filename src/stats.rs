//! Statistical utility functions shared across modules
//!
//! Robust location estimates used for pooled ratios and for
//! rescaling fallback size factors.

use statrs::statistics::{Data, Median};

/// Median of the finite values in `values`; `None` when none are finite.
pub fn median(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(Data::new(finite).median())
}

/// Robust average of ratios.
///
/// `trim` is the fraction discarded from each end of the sorted values
/// before averaging. At `trim >= 0.5`, or when trimming would leave
/// nothing, the median is returned instead.
pub fn trimmed_location(values: &[f64], trim: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    if trim >= 0.5 {
        return median(&sorted);
    }

    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let cut = (trim.max(0.0) * n as f64).floor() as usize;
    if 2 * cut >= n {
        return median(&sorted);
    }

    let kept = &sorted[cut..n - cut];
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Arithmetic mean; `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
