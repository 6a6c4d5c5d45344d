//! Plain descriptors shared by both ends of the protocol.

mod optimizer;
mod table;

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub use optimizer::OptimizerSpec;
pub use table::{DType, InitializerSpec, SparseTableSpec};

/// Server assigned identifier of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub u64);

/// Server assigned identifier of a table, unique within its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u64);

impl Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}
