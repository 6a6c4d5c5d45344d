use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    thread,
};

use crate::error::{PsErr, Result};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8765;
const DEFAULT_CHECKPOINT_DIR: &str = "./checkpoints";

/// Runtime settings of the parameter server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub checkpoint_dir: PathBuf,
    pub sparse_shards: NonZeroUsize,
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            sparse_shards: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            seed: None,
        }
    }
}

impl ServerConfig {
    /// Reads the configuration from the `HOST`, `PORT`, `CHECKPOINT_DIR`, `SPARSE_SHARDS`
    /// and `SEED` environment variables, unset ones keep their default.
    ///
    /// # Returns
    /// An `InvalidConfig` error if a variable is set but can't be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = env::var("HOST") {
            config.host = host;
        }
        if let Some(port) = parse_env("PORT")? {
            config.port = port;
        }
        if let Ok(dir) = env::var("CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(shards) = parse_env("SPARSE_SHARDS")? {
            config.sparse_shards = shards;
        }
        config.seed = parse_env("SEED")?;

        Ok(config)
    }

    /// The address to listen at.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: FromStr>(var: &str) -> Result<Option<T>> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| PsErr::InvalidConfig(format!("{var}={raw} is not valid"))),
        Err(_) => Ok(None),
    }
}

/// A read-only view over the string map of an optimizer or initializer descriptor.
pub(crate) struct ConfMap<'a> {
    owner: &'a str,
    map: &'a BTreeMap<String, String>,
}

impl<'a> ConfMap<'a> {
    /// Creates a new `ConfMap` after checking that it only holds `known` keys.
    ///
    /// # Arguments
    /// * `owner` - The name of the optimizer or initializer, used in errors.
    /// * `map` - The raw configuration.
    /// * `known` - Every key `owner` understands.
    pub fn new(owner: &'a str, map: &'a BTreeMap<String, String>, known: &[&str]) -> Result<Self> {
        let known: BTreeSet<_> = known.iter().copied().collect();

        if let Some(key) = map.keys().find(|key| !known.contains(key.as_str())) {
            return Err(PsErr::InvalidConfig(format!(
                "{owner} doesn't accept the `{key}` option"
            )));
        }

        Ok(Self { owner, map })
    }

    /// Parses `key`, falling back to `default` when it's absent.
    pub fn get<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        let Some(raw) = self.map.get(key) else {
            return Ok(default);
        };

        raw.trim().parse().map_err(|_| {
            PsErr::InvalidConfig(format!("{}: `{key}` = `{raw}` is malformed", self.owner))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = map(&[("momentum", "0.9"), ("mumentum", "0.9")]);
        assert!(ConfMap::new("sgd", &raw, &["momentum"]).is_err());
    }

    #[test]
    fn values_and_defaults() {
        let raw = map(&[("eps", "1e-6"), ("amsgrad", "true")]);
        let conf = ConfMap::new("adam", &raw, &["eps", "amsgrad", "beta1"]).unwrap();

        assert_eq!(conf.get("eps", 1e-8_f32).unwrap(), 1e-6);
        assert!(conf.get("amsgrad", false).unwrap());
        assert_eq!(conf.get("beta1", 0.9_f32).unwrap(), 0.9);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let raw = map(&[("eps", "tiny")]);
        let conf = ConfMap::new("adam", &raw, &["eps"]).unwrap();
        assert!(conf.get("eps", 1e-8_f32).is_err());
    }
}
