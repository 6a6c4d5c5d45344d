//! Typed handles to the tables of a registered model.

mod combine;
mod dense;
mod sparse;

pub use combine::{CombineTable, combine_specs};
pub use dense::{DenseTable, combine_pull};
pub use sparse::SparseTable;

use ndarray::{CowArray, Dimension};

use crate::error::{Result, WorkerErr};

/// The values of `array` in row major order, `array` must come from `as_standard_layout`.
fn contiguous<'a, D: Dimension>(array: &'a CowArray<'_, f32, D>) -> Result<&'a [f32]> {
    array
        .as_slice()
        .ok_or_else(|| WorkerErr::Shape("array is not in standard layout".into()))
}
