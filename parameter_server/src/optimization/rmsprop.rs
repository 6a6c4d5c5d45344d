use super::Optimizer;
use crate::storage::{Result, SizeMismatchErr};

#[derive(Debug)]
pub struct RmsProp {
    weight_decay: f32,
    momentum: f32,
    alpha: f32,
    eps: f32,
    centered: bool,
    square_avg: Box<[f32]>,
    grad_avg: Box<[f32]>,
    buf: Box<[f32]>,
}

impl RmsProp {
    /// Creates a new `RmsProp` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `weight_decay` - L2 penalty added to the gradient.
    /// * `momentum` - The momentum factor, `0` disables the momentum buffer.
    /// * `alpha` - Smoothing constant of the squared gradient average.
    /// * `eps` - Term added to the denominator for numerical stability.
    /// * `centered` - Whether to normalize by an estimation of the gradient variance.
    pub fn new(
        len: usize,
        weight_decay: f32,
        momentum: f32,
        alpha: f32,
        eps: f32,
        centered: bool,
    ) -> Self {
        let zeros = |enabled: bool| {
            if enabled {
                vec![0.; len].into_boxed_slice()
            } else {
                Box::default()
            }
        };

        Self {
            weight_decay,
            momentum,
            alpha,
            eps,
            centered,
            square_avg: zeros(true),
            grad_avg: zeros(centered),
            buf: zeros(momentum != 0.),
        }
    }
}

impl Optimizer for RmsProp {
    fn update_params(&mut self, grad: &[f32], lr: f32, params: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(params.len(), grad.len())?;
        SizeMismatchErr::check(self.square_avg.len(), grad.len())?;

        let Self {
            weight_decay: wd,
            momentum: mu,
            alpha,
            eps,
            centered,
            ..
        } = *self;

        for (i, (p, g)) in params.iter_mut().zip(grad).enumerate() {
            let g = g + wd * *p;

            let sq = &mut self.square_avg[i];
            *sq = alpha * *sq + (1. - alpha) * g * g;

            let mut avg = *sq;
            if centered {
                let ga = &mut self.grad_avg[i];
                *ga = alpha * *ga + (1. - alpha) * g;
                avg -= *ga * *ga;
            }

            let denom = avg.sqrt() + eps;

            if mu != 0. {
                let b = &mut self.buf[i];
                *b = mu * *b + g / denom;
                *p -= lr * *b;
            } else {
                *p -= lr * g / denom;
            }
        }

        Ok(())
    }
}
