/// A learning rate that may change from one optimization step to the next.
pub trait LrSchedule: Send + Sync {
    /// The learning rate of the current step.
    fn lr(&self) -> f32;

    /// Moves the schedule to the next step.
    fn step(&mut self);
}

/// The same learning rate for every step.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLr {
    lr: f32,
}

impl ConstantLr {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl LrSchedule for ConstantLr {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {}
}

/// Multiplies the learning rate by `gamma` on every step.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialLr {
    lr: f32,
    gamma: f32,
}

impl ExponentialLr {
    pub fn new(lr: f32, gamma: f32) -> Self {
        Self { lr, gamma }
    }
}

impl LrSchedule for ExponentialLr {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {
        self.lr *= self.gamma;
    }
}

/// Multiplies the learning rate by `gamma` once every `step_size` steps.
#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    lr: f32,
    gamma: f32,
    step_size: usize,
    steps: usize,
}

impl StepLr {
    /// Creates a new `StepLr`.
    ///
    /// # Arguments
    /// * `lr` - The initial learning rate.
    /// * `step_size` - The amount of steps between decays, zero never decays.
    /// * `gamma` - The decay factor.
    pub fn new(lr: f32, step_size: usize, gamma: f32) -> Self {
        Self {
            lr,
            gamma,
            step_size,
            steps: 0,
        }
    }
}

impl LrSchedule for StepLr {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {
        self.steps += 1;

        if self.step_size > 0 && self.steps % self.step_size == 0 {
            self.lr *= self.gamma;
        }
    }
}
