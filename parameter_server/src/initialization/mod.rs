mod constant;
mod error;
mod initializer;
mod random;

use comms::specs::InitializerSpec;

pub use constant::ConstInitializer;
pub use initializer::Initializer;
pub use random::RandInitializer;

use crate::{
    config::ConfMap,
    error::{PsErr, Result},
};

/// Builds the initializer described by `spec` for rows of length `dimension`.
///
/// The Xavier schemes treat a row as a square block, fan in and fan out are both `dimension`.
///
/// # Arguments
/// * `spec` - The descriptor sent by the client.
/// * `dimension` - The row length of the table.
/// * `seed` - An optional seed for the random schemes.
///
/// # Returns
/// An `InvalidConfig` error on unknown kinds, unknown keys or invalid parameters.
pub fn from_spec(
    spec: &InitializerSpec,
    dimension: usize,
    seed: Option<u64>,
) -> Result<Box<dyn Initializer>> {
    let kind = spec.kind.to_ascii_lowercase();
    let config = &spec.config;

    let initializer: Box<dyn Initializer> = match kind.as_str() {
        "constant" => {
            let conf = ConfMap::new("constant", config, &["value"])?;
            Box::new(ConstInitializer::new(conf.get("value", 0.)?))
        }
        "uniform" => {
            let conf = ConfMap::new("uniform", config, &["lower", "upper"])?;
            let lower = conf.get("lower", 0.)?;
            let upper = conf.get("upper", 1.)?;
            Box::new(RandInitializer::uniform(seed, lower, upper)?)
        }
        "normal" => {
            let conf = ConfMap::new("normal", config, &["mean", "stddev"])?;
            let mean = conf.get("mean", 0.)?;
            let stddev = conf.get("stddev", 1.)?;
            Box::new(RandInitializer::normal(seed, mean, stddev)?)
        }
        "xavier_uniform" => {
            let conf = ConfMap::new("xavier_uniform", config, &["gain"])?;
            let gain = conf.get("gain", 1.)?;
            Box::new(RandInitializer::xavier_uniform(seed, gain, dimension, dimension)?)
        }
        "xavier_normal" => {
            let conf = ConfMap::new("xavier_normal", config, &["gain"])?;
            let gain = conf.get("gain", 1.)?;
            Box::new(RandInitializer::xavier_normal(seed, gain, dimension, dimension)?)
        }
        other => {
            return Err(PsErr::InvalidConfig(format!(
                "unknown initializer kind `{other}`"
            )));
        }
    };

    Ok(initializer)
}
