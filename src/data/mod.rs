//! Data structures for single-cell count data

mod clusters;
mod count_matrix;

pub use clusters::ClusterLabels;
pub use count_matrix::CountMatrix;
