mod adagrad;
mod adam;
mod optimizer;
mod rmsprop;
mod sgd;

use comms::specs::OptimizerSpec;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use optimizer::Optimizer;
pub use rmsprop::RmsProp;
pub use sgd::Sgd;

use crate::{
    config::ConfMap,
    error::{PsErr, Result},
};

/// A validated optimizer descriptor, able to build fresh optimizer state on demand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    Sgd {
        momentum: f32,
        dampening: f32,
        weight_decay: f32,
        nesterov: bool,
    },
    Adagrad {
        weight_decay: f32,
        eps: f32,
    },
    Adam {
        weight_decay: f32,
        beta1: f32,
        beta2: f32,
        eps: f32,
        amsgrad: bool,
    },
    RmsProp {
        weight_decay: f32,
        momentum: f32,
        alpha: f32,
        eps: f32,
        centered: bool,
    },
}

impl OptimizerConfig {
    /// Parses and validates an `OptimizerSpec`.
    ///
    /// # Returns
    /// An `InvalidConfig` error on unknown kinds, unknown keys or malformed values.
    pub fn from_spec(spec: &OptimizerSpec) -> Result<Self> {
        let kind = spec.kind.to_ascii_lowercase();
        let config = &spec.config;

        let optimizer = match kind.as_str() {
            "sgd" => {
                let conf = ConfMap::new(
                    "sgd",
                    config,
                    &["momentum", "dampening", "weight_decay", "nesterov"],
                )?;

                let optimizer = Self::Sgd {
                    momentum: conf.get("momentum", 0.)?,
                    dampening: conf.get("dampening", 0.)?,
                    weight_decay: conf.get("weight_decay", 0.)?,
                    nesterov: conf.get("nesterov", false)?,
                };

                if let Self::Sgd {
                    momentum,
                    dampening,
                    nesterov: true,
                    ..
                } = optimizer
                    && (momentum <= 0. || dampening != 0.)
                {
                    return Err(PsErr::InvalidConfig(
                        "sgd: nesterov requires a positive momentum and zero dampening".into(),
                    ));
                }

                optimizer
            }
            "adagrad" => {
                let conf = ConfMap::new("adagrad", config, &["weight_decay", "eps"])?;

                Self::Adagrad {
                    weight_decay: conf.get("weight_decay", 0.)?,
                    eps: conf.get("eps", 1e-10)?,
                }
            }
            "adam" => {
                let conf = ConfMap::new(
                    "adam",
                    config,
                    &["weight_decay", "beta1", "beta2", "eps", "amsgrad"],
                )?;

                let beta1 = conf.get("beta1", 0.9)?;
                let beta2 = conf.get("beta2", 0.999)?;

                if !(0. ..1.).contains(&beta1) || !(0. ..1.).contains(&beta2) {
                    return Err(PsErr::InvalidConfig(format!(
                        "adam: betas must lie in [0, 1), got {beta1} and {beta2}"
                    )));
                }

                Self::Adam {
                    weight_decay: conf.get("weight_decay", 0.)?,
                    beta1,
                    beta2,
                    eps: conf.get("eps", 1e-8)?,
                    amsgrad: conf.get("amsgrad", false)?,
                }
            }
            "rmsprop" => {
                let conf = ConfMap::new(
                    "rmsprop",
                    config,
                    &["weight_decay", "momentum", "alpha", "eps", "centered"],
                )?;

                Self::RmsProp {
                    weight_decay: conf.get("weight_decay", 0.)?,
                    momentum: conf.get("momentum", 0.)?,
                    alpha: conf.get("alpha", 0.99)?,
                    eps: conf.get("eps", 1e-8)?,
                    centered: conf.get("centered", false)?,
                }
            }
            other => {
                return Err(PsErr::InvalidConfig(format!(
                    "unknown optimizer kind `{other}`"
                )));
            }
        };

        Ok(optimizer)
    }

    /// Builds fresh optimizer state for `len` parameters.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer> {
        match *self {
            Self::Sgd {
                momentum,
                dampening,
                weight_decay,
                nesterov,
            } => Box::new(Sgd::new(momentum, dampening, weight_decay, nesterov)),
            Self::Adagrad { weight_decay, eps } => Box::new(Adagrad::new(len, weight_decay, eps)),
            Self::Adam {
                weight_decay,
                beta1,
                beta2,
                eps,
                amsgrad,
            } => Box::new(Adam::new(len, weight_decay, beta1, beta2, eps, amsgrad)),
            Self::RmsProp {
                weight_decay,
                momentum,
                alpha,
                eps,
                centered,
            } => Box::new(RmsProp::new(
                len,
                weight_decay,
                momentum,
                alpha,
                eps,
                centered,
            )),
        }
    }
}
