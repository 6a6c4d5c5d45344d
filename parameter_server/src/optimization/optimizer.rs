use crate::storage::Result;

/// Turns a gradient into an update of the parameters it was computed for.
///
/// Implementations hold whatever per-parameter state the algorithm needs, so an instance
/// is bound to a fixed amount of parameters.
pub trait Optimizer: Send + Sync {
    /// Applies one update step in place.
    ///
    /// # Arguments
    /// * `grad` - The gradient of the loss with respect to `params`.
    /// * `lr` - The current learning rate of the owning model.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `grad` and `params` don't have the same length.
    fn update_params(&mut self, grad: &[f32], lr: f32, params: &mut [f32]) -> Result<()>;
}
