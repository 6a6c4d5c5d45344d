use super::Optimizer;
use crate::storage::{Result, SizeMismatchErr};

#[derive(Debug)]
pub struct Adagrad {
    weight_decay: f32,
    eps: f32,
    state_sum: Box<[f32]>,
}

impl Adagrad {
    /// Creates a new `Adagrad` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `weight_decay` - L2 penalty added to the gradient.
    /// * `eps` - Term added to the denominator for numerical stability.
    pub fn new(len: usize, weight_decay: f32, eps: f32) -> Self {
        Self {
            weight_decay,
            eps,
            state_sum: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for Adagrad {
    fn update_params(&mut self, grad: &[f32], lr: f32, params: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(params.len(), grad.len())?;
        SizeMismatchErr::check(self.state_sum.len(), grad.len())?;

        let Self {
            weight_decay: wd,
            eps,
            ..
        } = *self;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.state_sum.iter_mut())
            .for_each(|((p, g), sum)| {
                let g = g + wd * *p;
                *sum += g * g;
                *p -= lr * g / (sum.sqrt() + eps);
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_lr() {
        let mut adagrad = Adagrad::new(2, 0., 0.);
        let mut params = [0., 0.];

        adagrad.update_params(&[2., -4.], 0.5, &mut params).unwrap();
        assert_eq!(params, [-0.5, 0.5]);
    }
}
