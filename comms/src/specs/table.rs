use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// The storage precision of a table. Values always travel as `f32`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    #[default]
    F32,
    F16,
    Bf16,
}

impl DType {
    /// Rounds every value in `values` to the precision of this dtype.
    pub fn quantize(self, values: &mut [f32]) {
        match self {
            DType::F32 => {}
            DType::F16 => values
                .iter_mut()
                .for_each(|v| *v = f16::from_f32(*v).to_f32()),
            DType::Bf16 => values
                .iter_mut()
                .for_each(|v| *v = bf16::from_f32(*v).to_f32()),
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
        };

        f.write_str(name)
    }
}

/// The description of how fresh table rows are filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializerSpec {
    pub kind: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl InitializerSpec {
    /// Creates a new `InitializerSpec` with an empty configuration.
    ///
    /// # Arguments
    /// * `kind` - The name of the initialization scheme.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: BTreeMap::new(),
        }
    }

    pub fn constant(value: f32) -> Self {
        Self::new("constant").with("value", value)
    }

    pub fn uniform(lower: f32, upper: f32) -> Self {
        Self::new("uniform")
            .with("lower", lower)
            .with("upper", upper)
    }

    pub fn normal(mean: f32, stddev: f32) -> Self {
        Self::new("normal")
            .with("mean", mean)
            .with("stddev", stddev)
    }

    pub fn xavier_uniform(gain: f32) -> Self {
        Self::new("xavier_uniform").with("gain", gain)
    }

    pub fn xavier_normal(gain: f32) -> Self {
        Self::new("xavier_normal").with("gain", gain)
    }

    /// Sets a configuration entry, overriding any previous value for `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.config.insert(key.into(), value.to_string());
        self
    }
}

/// Everything the server needs to create one sparse table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseTableSpec {
    pub name: String,
    pub dimension: usize,
    pub dtype: DType,
    pub initializer: InitializerSpec,
}

impl SparseTableSpec {
    /// Creates a new `SparseTableSpec`.
    ///
    /// # Arguments
    /// * `name` - The table name, unique within its model.
    /// * `dimension` - The length of every row.
    /// * `dtype` - The storage precision.
    /// * `initializer` - How rows are filled the first time they are touched.
    pub fn new(
        name: impl Into<String>,
        dimension: usize,
        dtype: DType,
        initializer: InitializerSpec,
    ) -> Self {
        Self {
            name: name.into(),
            dimension,
            dtype,
            initializer,
        }
    }
}
