use comms::specs::DType;
use parking_lot::RwLock;

use crate::{
    optimization::Optimizer,
    storage::{Result, SizeMismatchErr},
};

struct DenseState {
    values: Box<[f32]>,
    optimizer: Box<dyn Optimizer>,
}

/// A fixed shape tensor updated as a whole.
pub struct DenseTable {
    name: String,
    shape: Vec<usize>,
    dtype: DType,
    state: RwLock<DenseState>,
}

impl DenseTable {
    /// Creates a new `DenseTable` seeded with `values`.
    ///
    /// # Arguments
    /// * `name` - The table name.
    /// * `shape` - The tensor shape, `values` must hold its product of elements.
    /// * `dtype` - The storage precision.
    /// * `values` - The initial values, flattened in row major order.
    /// * `optimizer` - The optimizer state for this table.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `values` doesn't match `shape`.
    pub fn new(
        name: String,
        shape: Vec<usize>,
        dtype: DType,
        mut values: Vec<f32>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<Self> {
        SizeMismatchErr::check(shape.iter().product(), values.len())?;
        dtype.quantize(&mut values);

        Ok(Self {
            name,
            shape,
            dtype,
            state: RwLock::new(DenseState {
                values: values.into_boxed_slice(),
                optimizer,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Whether this table was registered with the given shape and dtype.
    pub fn matches(&self, shape: &[usize], dtype: DType) -> bool {
        self.shape == shape && self.dtype == dtype
    }

    /// Applies `grad` to the values through the table's optimizer.
    pub fn push(&self, grad: &[f32], lr: f32) -> Result<()> {
        let mut state = self.state.write();
        let DenseState { values, optimizer } = &mut *state;

        optimizer.update_params(grad, lr, values)?;
        self.dtype.quantize(values);
        Ok(())
    }

    /// Appends the current values to `out`.
    pub fn pull_into(&self, out: &mut Vec<f32>) -> usize {
        let state = self.state.read();
        out.extend_from_slice(&state.values);
        state.values.len()
    }

    /// Applies `grad` and appends the resulting values to `out`, without letting another
    /// update in between.
    pub fn push_pull_into(&self, grad: &[f32], lr: f32, out: &mut Vec<f32>) -> Result<usize> {
        let mut state = self.state.write();
        let DenseState { values, optimizer } = &mut *state;

        optimizer.update_params(grad, lr, values)?;
        self.dtype.quantize(values);
        out.extend_from_slice(values);
        Ok(values.len())
    }

    pub fn snapshot(&self) -> Vec<f32> {
        self.state.read().values.to_vec()
    }

    /// Overwrites the values, keeping the optimizer state.
    pub fn restore(&self, values: &[f32]) -> Result<()> {
        let mut state = self.state.write();
        SizeMismatchErr::check(state.values.len(), values.len())?;
        state.values.copy_from_slice(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::Sgd;

    fn table(values: Vec<f32>, dtype: DType) -> DenseTable {
        let shape = vec![values.len()];
        let optimizer = Box::new(Sgd::new(0., 0., 0., false));
        DenseTable::new("w".into(), shape, dtype, values, optimizer).unwrap()
    }

    #[test]
    fn shape_must_match_values() {
        let optimizer = Box::new(Sgd::new(0., 0., 0., false));
        let res = DenseTable::new("w".into(), vec![2, 3], DType::F32, vec![0.; 5], optimizer);
        assert!(res.is_err());
    }

    #[test]
    fn push_then_pull() {
        let table = table(vec![1., 2.], DType::F32);
        table.push(&[1., 1.], 0.5).unwrap();

        let mut out = Vec::new();
        assert_eq!(table.pull_into(&mut out), 2);
        assert_eq!(out, [0.5, 1.5]);
    }

    #[test]
    fn push_pull_returns_updated_values() {
        let table = table(vec![1., 2.], DType::F32);
        let mut out = vec![9.];

        table.push_pull_into(&[2., 4.], 0.25, &mut out).unwrap();
        assert_eq!(out, [9., 0.5, 1.]);
    }

    #[test]
    fn half_tables_stay_rounded() {
        let table = table(vec![0.], DType::F16);
        table.push(&[-1. / 3.], 1.).unwrap();

        let value = table.snapshot()[0];
        assert_eq!(value, half::f16::from_f32(1. / 3.).to_f32());
    }

    #[test]
    fn wrong_gradient_size() {
        let table = table(vec![1., 2.], DType::F32);
        assert!(table.push(&[1.], 0.1).is_err());
        assert_eq!(table.snapshot(), [1., 2.]);
    }
}
