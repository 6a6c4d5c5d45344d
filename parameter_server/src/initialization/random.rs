use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal, Uniform};

use super::Initializer;
use crate::error::Result;

const ROW_SEED_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// An initializer that samples rows from a probabilistic distribution.
///
/// When seeded, every row draws from its own generator derived from the seed and the
/// row id, so a row's initial values don't depend on the order rows are touched in.
pub struct RandInitializer<D: Distribution<f32>> {
    seed: Option<u64>,
    distribution: D,
}

impl<D: Distribution<f32>> RandInitializer<D> {
    /// Creates a new `RandInitializer`.
    ///
    /// # Arguments
    /// * `seed` - An optional seed, `None` draws from the thread local generator.
    /// * `distribution` - The distribution to sample the values from.
    pub fn new(seed: Option<u64>, distribution: D) -> Self {
        Self { seed, distribution }
    }

    fn sample_into<R: Rng>(&self, rng: &mut R, out: &mut [f32]) {
        out.iter_mut()
            .for_each(|v| *v = self.distribution.sample(&mut *rng));
    }
}

impl RandInitializer<Uniform<f32>> {
    /// Creates a new `RandInitializer` with a uniform distribution.
    ///
    /// # Arguments
    /// * `seed` - An optional seed.
    /// * `lower` - The inclusive lower limit.
    /// * `upper` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (lower >= upper).
    pub fn uniform(seed: Option<u64>, lower: f32, upper: f32) -> Result<Self> {
        Ok(Self::new(seed, Uniform::new(lower, upper)?))
    }

    /// Creates a new `RandInitializer` using Xavier uniform initialization.
    ///
    /// # Arguments
    /// * `seed` - An optional seed.
    /// * `gain` - A scaling factor for the range.
    /// * `fan_in` - The number of input units.
    /// * `fan_out` - The number of output units.
    ///
    /// # Returns
    /// An error if the calculated range is invalid.
    pub fn xavier_uniform(seed: Option<u64>, gain: f32, fan_in: usize, fan_out: usize) -> Result<Self> {
        let range = gain * (6. / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(seed, -range, range)
    }
}

impl RandInitializer<Normal<f32>> {
    /// Creates a new `RandInitializer` with a normal distribution.
    ///
    /// # Arguments
    /// * `seed` - An optional seed.
    /// * `mean` - The mean of the distribution.
    /// * `stddev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `stddev` is negative or not finite.
    pub fn normal(seed: Option<u64>, mean: f32, stddev: f32) -> Result<Self> {
        Ok(Self::new(seed, Normal::new(mean, stddev)?))
    }

    /// Creates a new `RandInitializer` using Xavier normal initialization.
    ///
    /// # Arguments
    /// * `seed` - An optional seed.
    /// * `gain` - A scaling factor for the standard deviation.
    /// * `fan_in` - The number of input units.
    /// * `fan_out` - The number of output units.
    pub fn xavier_normal(seed: Option<u64>, gain: f32, fan_in: usize, fan_out: usize) -> Result<Self> {
        let stddev = gain * (2. / (fan_in + fan_out) as f32).sqrt();
        Self::normal(seed, 0., stddev)
    }
}

impl<D: Distribution<f32> + Send + Sync> Initializer for RandInitializer<D> {
    fn fill(&self, row_id: u64, out: &mut [f32]) {
        match self.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed ^ row_id.wrapping_mul(ROW_SEED_MIX));
                self.sample_into(&mut rng, out);
            }
            None => self.sample_into(&mut rand::rng(), out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: Option<u64> = Some(42);

    #[test]
    fn uniform_stays_in_range() {
        let init = RandInitializer::uniform(SEED, -1., 1.).unwrap();
        let mut row = [0.; 64];

        init.fill(3, &mut row);
        assert!(row.iter().all(|v| (-1. ..1.).contains(v)));
    }

    #[test]
    fn seeded_rows_are_reproducible() {
        let init = RandInitializer::normal(SEED, 0., 1.).unwrap();
        let (mut a, mut b, mut c) = ([0.; 8], [0.; 8], [0.; 8]);

        init.fill(10, &mut a);
        init.fill(11, &mut c);
        init.fill(10, &mut b);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn xavier_uniform_bound() {
        let init = RandInitializer::xavier_uniform(SEED, 1., 3, 3).unwrap();
        let mut row = [0.; 128];

        init.fill(0, &mut row);
        assert!(row.iter().all(|v| v.abs() <= 1.));
    }

    #[test]
    fn invalid_ranges() {
        assert!(RandInitializer::uniform(SEED, 1., 1.).is_err());
        assert!(RandInitializer::normal(SEED, 0., f32::NAN).is_err());
    }
}
