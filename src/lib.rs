//! rust_scnorm: size factor estimation and normalization for single-cell counts
//!
//! The centrepiece is pooled deconvolution: cells are summed into
//! overlapping pools within clusters, each pool gets a median-ratio factor
//! against a reference pseudo-cell, and per-cell factors are solved from the
//! pool memberships. Library-size and spike-in factors, log-normalization,
//! and downsampling cover the simpler alternatives.
//!
//! # Example
//!
//! ```ignore
//! use rust_scnorm::prelude::*;
//!
//! let counts = CountMatrix::from_array(data)?;
//! let clusters = KMeansClusters::default();
//! let estimate = compute_sum_factors_with(&counts, &clusters, &DeconvolutionParams::default())?;
//!
//! // Cells the pools could not resolve fall back to library-size factors
//! let size_factors = estimate.with_fallback(&library_size_factors(&counts)?)?;
//! let logcounts = log_normalize(&counts, &size_factors.to_vec(), &LogNormParams::default())?;
//! ```

pub mod clustering;
pub mod data;
pub mod deconvolution;
pub mod error;
pub mod normalization;
pub mod stats;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clustering::{ClusterAssigner, FixedClusters, KMeansClusters, KMeansParams};
    pub use crate::data::{ClusterLabels, CountMatrix};
    pub use crate::deconvolution::{
        compute_sum_factors, compute_sum_factors_with, ClusterFailure, DeconvolutionParams, FailureKind,
        LinearSolver, SizeFactorEstimate,
    };
    pub use crate::error::{Result, ScnormError};
    pub use crate::normalization::{
        center_size_factors, downsample_counts, library_size_factors, log_normalize, scale_counts,
        spike_in_size_factors, DownsampleTarget, LogBase, LogNormParams,
    };
}
