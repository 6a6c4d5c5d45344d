use super::Optimizer;
use crate::storage::{Result, SizeMismatchErr};

#[derive(Debug)]
pub struct Adam {
    weight_decay: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    amsgrad: bool,
    steps: i32,
    m: Box<[f32]>,
    v: Box<[f32]>,
    v_max: Box<[f32]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `weight_decay` - L2 penalty added to the gradient.
    /// * `beta1`, `beta2`, `eps` - Hyperparameters to the optimization algorithm.
    /// * `amsgrad` - Whether to keep the running maximum of the second moment.
    pub fn new(len: usize, weight_decay: f32, beta1: f32, beta2: f32, eps: f32, amsgrad: bool) -> Self {
        Self {
            weight_decay,
            beta1,
            beta2,
            eps,
            amsgrad,
            steps: 0,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
            v_max: if amsgrad {
                vec![0.; len].into_boxed_slice()
            } else {
                Box::default()
            },
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], lr: f32, params: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(params.len(), grad.len())?;
        SizeMismatchErr::check(self.m.len(), grad.len())?;

        let Self {
            weight_decay: wd,
            beta1: b1,
            beta2: b2,
            eps,
            amsgrad,
            ..
        } = *self;

        self.steps = self.steps.saturating_add(1);
        let bc1 = 1. - b1.powi(self.steps);
        let bc2 = 1. - b2.powi(self.steps);

        for (i, (p, g)) in params.iter_mut().zip(grad).enumerate() {
            let g = g + wd * *p;

            let m = &mut self.m[i];
            let v = &mut self.v[i];
            *m = b1 * *m + (1. - b1) * g;
            *v = b2 * *v + (1. - b2) * g * g;

            let m_hat = *m / bc1;
            let mut v_hat = *v / bc2;

            if amsgrad {
                let v_max = &mut self.v_max[i];
                *v_max = v_max.max(v_hat);
                v_hat = *v_max;
            }

            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_is_sign_of_gradient() {
        let mut adam = Adam::new(3, 0., 0.9, 0.999, 0., false);
        let mut params = [0., 0., 0.];

        adam.update_params(&[3., -0.5, 10.], 0.1, &mut params).unwrap();

        for (p, expected) in params.iter().zip([-0.1, 0.1, -0.1]) {
            assert!((p - expected).abs() < 1e-5, "{p} != {expected}");
        }
    }

    #[test]
    fn amsgrad_keeps_maximum() {
        let mut adam = Adam::new(1, 0., 0.9, 0.999, 1e-8, true);
        let mut params = [0.];

        adam.update_params(&[10.], 0.1, &mut params).unwrap();
        let after_big = adam.v_max[0];
        adam.update_params(&[0.1], 0.1, &mut params).unwrap();
        assert!(adam.v_max[0] >= after_big * 0.5);
    }
}
