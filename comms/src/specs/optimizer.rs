use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The description of how a model's gradients are turned into updates.
///
/// Both the kind and the configuration are kept as strings, they are only
/// interpreted by the parameter server when the model is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl OptimizerSpec {
    /// Creates a new `OptimizerSpec` with an empty configuration.
    ///
    /// # Arguments
    /// * `kind` - The name of the optimization algorithm.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: BTreeMap::new(),
        }
    }

    /// Stochastic gradient descent.
    pub fn sgd() -> Self {
        Self::new("sgd")
    }

    pub fn adagrad() -> Self {
        Self::new("adagrad")
    }

    pub fn adam() -> Self {
        Self::new("adam")
    }

    pub fn rmsprop() -> Self {
        Self::new("rmsprop")
    }

    /// Sets a configuration entry, overriding any previous value for `key`.
    ///
    /// # Arguments
    /// * `key` - The hyperparameter name.
    /// * `value` - Its value, stored in its string form.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.config.insert(key.into(), value.to_string());
        self
    }
}
