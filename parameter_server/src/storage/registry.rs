use std::{num::NonZeroUsize, sync::Arc};

use comms::specs::{ModelId, OptimizerSpec};
use log::info;
use parking_lot::RwLock;

use crate::{
    error::{PsErr, Result},
    optimization::OptimizerConfig,
    storage::ModelEntry,
};

/// Every model known to the server, shared by all connections.
pub struct Registry {
    models: RwLock<Vec<Arc<ModelEntry>>>,
    seed: Option<u64>,
    sparse_shards: NonZeroUsize,
}

impl Registry {
    /// Creates a new empty `Registry`.
    ///
    /// # Arguments
    /// * `seed` - Seed for the random initializers of sparse tables, if any.
    /// * `sparse_shards` - The amount of row shards of every sparse table.
    pub fn new(seed: Option<u64>, sparse_shards: NonZeroUsize) -> Self {
        Self {
            models: RwLock::new(Vec::new()),
            seed,
            sparse_shards,
        }
    }

    /// Registers a model, or returns the id of the live model with the same name.
    ///
    /// # Returns
    /// A `Registration` error if the optimizer descriptor is invalid or differs from the one
    /// the live model was registered with.
    pub fn register_model(&self, name: &str, spec: OptimizerSpec) -> Result<ModelId> {
        let optimizer = OptimizerConfig::from_spec(&spec)
            .map_err(|e| PsErr::Registration(e.to_string()))?;

        let mut models = self.models.write();

        if let Some(model) = models.iter().find(|model| model.name() == name) {
            if *model.optimizer_spec() != spec {
                return Err(PsErr::Registration(format!(
                    "model {name} is already registered with optimizer {:?}",
                    model.optimizer_spec()
                )));
            }

            return Ok(model.id());
        }

        let id = ModelId(models.len() as u64);
        let model = ModelEntry::new(
            id,
            name.to_string(),
            spec,
            optimizer,
            self.seed,
            self.sparse_shards,
        );
        models.push(Arc::new(model));

        info!(model_id = id.0; "registered model {name}");
        Ok(id)
    }

    pub fn model(&self, id: ModelId) -> Result<Arc<ModelEntry>> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.models.read().get(i).cloned())
            .ok_or(PsErr::UnknownModel(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(None, NonZeroUsize::MIN)
    }

    #[test]
    fn same_name_same_optimizer() {
        let registry = registry();

        let a = registry.register_model("ctr", OptimizerSpec::adam()).unwrap();
        let b = registry.register_model("ctr", OptimizerSpec::adam()).unwrap();
        let c = registry.register_model("cvr", OptimizerSpec::adam()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.model(c).unwrap().name(), "cvr");
    }

    #[test]
    fn conflicting_optimizer() {
        let registry = registry();
        registry.register_model("ctr", OptimizerSpec::adam()).unwrap();

        let res = registry.register_model("ctr", OptimizerSpec::sgd());
        assert!(matches!(res, Err(PsErr::Registration(_))));
    }

    #[test]
    fn invalid_optimizer() {
        let res = registry().register_model("ctr", OptimizerSpec::new("nadam"));
        assert!(matches!(res, Err(PsErr::Registration(_))));
    }

    #[test]
    fn unknown_model() {
        assert!(matches!(registry().model(ModelId(3)), Err(PsErr::UnknownModel(_))));
    }
}
