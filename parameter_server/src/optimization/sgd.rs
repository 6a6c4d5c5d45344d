use super::Optimizer;
use crate::storage::{Result, SizeMismatchErr};

/// Stochastic gradient descent with optional momentum, dampening, nesterov and weight decay.
#[derive(Debug)]
pub struct Sgd {
    momentum: f32,
    dampening: f32,
    weight_decay: f32,
    nesterov: bool,
    velocity: Option<Box<[f32]>>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `momentum` - The momentum factor, `0` disables the velocity buffer.
    /// * `dampening` - Dampening applied to the gradient when accumulating momentum.
    /// * `weight_decay` - L2 penalty added to the gradient.
    /// * `nesterov` - Whether to use nesterov momentum.
    pub fn new(momentum: f32, dampening: f32, weight_decay: f32, nesterov: bool) -> Self {
        Self {
            momentum,
            dampening,
            weight_decay,
            nesterov,
            velocity: None,
        }
    }
}

impl Optimizer for Sgd {
    fn update_params(&mut self, grad: &[f32], lr: f32, params: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(params.len(), grad.len())?;

        let Self {
            momentum: mu,
            dampening,
            weight_decay: wd,
            nesterov,
            ..
        } = *self;

        if mu == 0. {
            params
                .iter_mut()
                .zip(grad)
                .for_each(|(p, g)| *p -= lr * (g + wd * *p));

            return Ok(());
        }

        let first_step = self.velocity.is_none();
        let velocity = self
            .velocity
            .get_or_insert_with(|| vec![0.; grad.len()].into_boxed_slice());

        params
            .iter_mut()
            .zip(grad)
            .zip(velocity.iter_mut())
            .for_each(|((p, g), v)| {
                let g = g + wd * *p;

                *v = if first_step {
                    g
                } else {
                    mu * *v + (1. - dampening) * g
                };

                let step = if nesterov { g + mu * *v } else { *v };
                *p -= lr * step;
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_descent() {
        let mut sgd = Sgd::new(0., 0., 0., false);
        let mut params = [1., 2., 3.];

        sgd.update_params(&[1., -1., 0.5], 0.5, &mut params).unwrap();
        assert_eq!(params, [0.5, 2.5, 2.75]);
    }

    #[test]
    fn momentum_accumulates() {
        let mut sgd = Sgd::new(0.5, 0., 0., false);
        let mut params = [0.];

        sgd.update_params(&[1.], 1., &mut params).unwrap();
        assert_eq!(params, [-1.]);

        sgd.update_params(&[1.], 1., &mut params).unwrap();
        assert_eq!(params, [-2.5]);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut sgd = Sgd::new(0., 0., 0.5, false);
        let mut params = [2.];

        sgd.update_params(&[0.], 1., &mut params).unwrap();
        assert_eq!(params, [1.]);
    }

    #[test]
    fn size_mismatch() {
        let mut sgd = Sgd::new(0., 0., 0., false);
        let err = sgd.update_params(&[1.], 1., &mut [0., 0.]).unwrap_err();
        assert_eq!(err, SizeMismatchErr { expected: 2, got: 1 });
    }
}
