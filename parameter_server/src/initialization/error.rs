use rand_distr::{NormalError, uniform::Error as UniformError};

use crate::error::PsErr;

impl From<NormalError> for PsErr {
    fn from(value: NormalError) -> Self {
        Self::InvalidConfig(format!("normal distribution: {value}"))
    }
}

impl From<UniformError> for PsErr {
    fn from(value: UniformError) -> Self {
        Self::InvalidConfig(format!("uniform distribution: {value}"))
    }
}
