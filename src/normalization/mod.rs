//! Normalization methods for single-cell count data

mod downsample;
mod log_transform;
mod size_factors;

pub use downsample::{downsample_counts, DownsampleTarget};
pub use log_transform::{log_normalize, scale_counts, LogBase, LogNormParams};
pub use size_factors::{center_size_factors, library_size_factors, spike_in_size_factors};
