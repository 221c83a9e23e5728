//! Data containers: the dense event table and the sparse coupling matrix.

mod dataset;
mod sparse;

pub use dataset::{DataError, Dataset};
pub use sparse::{CsrMatrix, RowIter};
