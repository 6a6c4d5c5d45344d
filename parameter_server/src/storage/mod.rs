mod dense;
mod error;
mod model;
mod registry;
mod sparse;

pub use dense::DenseTable;
pub use error::{Result, SizeMismatchErr};
pub use model::{CheckpointGuard, ModelEntry, Table};
pub use registry::Registry;
pub use sparse::SparseTable;
