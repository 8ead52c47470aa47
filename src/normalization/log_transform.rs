//! Scaling by size factors and log-transformation with a pseudo-count

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::data::CountMatrix;
use crate::error::{Result, ScnormError};

use super::size_factors::center_size_factors;

/// Base of the logarithm applied by [`log_normalize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBase {
    /// log2
    Two,
    /// ln
    E,
    /// log10
    Ten,
}

impl LogBase {
    fn log(self, x: f64) -> f64 {
        match self {
            LogBase::Two => x.log2(),
            LogBase::E => x.ln(),
            LogBase::Ten => x.log10(),
        }
    }
}

/// Parameters for log-normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogNormParams {
    /// Added to every scaled count before taking the log
    pub pseudo_count: f64,
    pub base: LogBase,
    /// Re-center size factors to mean one before scaling, so the
    /// pseudo-count has the same relative weight as on the raw counts
    pub center_size_factors: bool,
}

impl Default for LogNormParams {
    fn default() -> Self {
        Self {
            pseudo_count: 1.0,
            base: LogBase::Two,
            center_size_factors: true,
        }
    }
}

fn check_size_factors(counts: &CountMatrix, size_factors: &[f64]) -> Result<()> {
    if size_factors.len() != counts.n_cells() {
        return Err(ScnormError::DimensionMismatch {
            expected: format!("{} size factors", counts.n_cells()),
            got: format!("{} size factors", size_factors.len()),
        });
    }
    if let Some((idx, &bad)) = size_factors
        .iter()
        .enumerate()
        .find(|(_, &s)| s <= 0.0 || !s.is_finite())
    {
        return Err(ScnormError::InvalidInput {
            reason: format!(
                "Size factor {} for cell '{}' is not strictly positive",
                bad,
                counts.cell_ids()[idx]
            ),
        });
    }
    Ok(())
}

/// Divide each cell's counts by its size factor
pub fn scale_counts(counts: &CountMatrix, size_factors: &[f64]) -> Result<Array2<f64>> {
    check_size_factors(counts, size_factors)?;

    let mut result = counts.counts().to_owned();
    for (mut column, &sf) in result.columns_mut().into_iter().zip(size_factors) {
        column.mapv_inplace(|x| x / sf);
    }
    Ok(result)
}

/// Log-normalized expression: `log_b(x / s_j + pseudo_count)` for every entry.
///
/// With the default pseudo-count of one, zero counts map to zero.
pub fn log_normalize(counts: &CountMatrix, size_factors: &[f64], params: &LogNormParams) -> Result<Array2<f64>> {
    if params.pseudo_count <= 0.0 || !params.pseudo_count.is_finite() {
        return Err(ScnormError::InvalidInput {
            reason: format!("Pseudo-count must be positive, got {}", params.pseudo_count),
        });
    }
    check_size_factors(counts, size_factors)?;

    let factors = if params.center_size_factors {
        center_size_factors(size_factors)?.to_vec()
    } else {
        size_factors.to_vec()
    };

    let mut result = scale_counts(counts, &factors)?;
    let (pseudo, base) = (params.pseudo_count, params.base);
    result.mapv_inplace(|x| base.log(x + pseudo));
    Ok(result)
}
