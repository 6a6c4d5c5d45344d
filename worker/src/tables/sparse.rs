use std::collections::HashMap;

use comms::specs::{DType, ModelId, SparseTableSpec, TableId};
use ndarray::{Array2, ArrayView2};

use crate::{
    error::{Result, WorkerErr},
    session::Session,
};

/// A registered sparse table, rows of fixed dimension addressed by an integer id.
#[derive(Debug, Clone)]
pub struct SparseTable {
    session: Session,
    model_id: ModelId,
    table_id: TableId,
    spec: SparseTableSpec,
}

impl SparseTable {
    /// Registers a sparse table described by `spec`.
    pub async fn register(session: &Session, model_id: ModelId, spec: SparseTableSpec) -> Result<Self> {
        let table_id = session.register_sparse_table(model_id, spec.clone()).await?;
        Ok(Self::from_parts(session.clone(), model_id, table_id, spec))
    }

    pub(crate) fn from_parts(
        session: Session,
        model_id: ModelId,
        table_id: TableId,
        spec: SparseTableSpec,
    ) -> Self {
        Self {
            session,
            model_id,
            table_id,
            spec,
        }
    }

    pub fn id(&self) -> TableId {
        self.table_id
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn dimension(&self) -> usize {
        self.spec.dimension
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn spec(&self) -> &SparseTableSpec {
        &self.spec
    }

    /// Fetches one row per index, in the order of `indices`.
    ///
    /// Repeated indices are fetched once and copied into every position they appear in.
    pub async fn pull(&self, indices: &[u64]) -> Result<Array2<f32>> {
        let (unique, positions) = dedup(indices);
        let rows = self
            .session
            .pull_sparse(self.model_id, self.table_id, &unique)
            .await?;

        self.expand(unique.len(), &positions, &rows)
    }

    /// Sends one gradient row per index without waiting for it to be applied.
    ///
    /// Rows of a repeated index are summed before being sent.
    ///
    /// # Errors
    /// `WorkerErr::Shape` if `grads` doesn't hold one row of the table's dimension per index.
    pub async fn push(&self, indices: &[u64], grads: ArrayView2<'_, f32>) -> Result<()> {
        self.check_grads(indices.len(), &grads)?;
        let (unique, summed) = coalesce(indices, grads);

        self.session
            .push_sparse(self.model_id, self.table_id, &unique, &summed)
            .await
    }

    /// Checks that `grads` holds one row of the table's dimension per index.
    pub(crate) fn check_grads(&self, indices: usize, grads: &ArrayView2<'_, f32>) -> Result<()> {
        if grads.dim() != (indices, self.spec.dimension) {
            return Err(WorkerErr::Shape(format!(
                "gradient of shape {:?} for {indices} rows of sparse table {} of dimension {}",
                grads.shape(),
                self.spec.name,
                self.spec.dimension
            )));
        }

        Ok(())
    }

    /// Builds the rows for every requested position out of the rows of the unique ids.
    pub(super) fn expand(
        &self,
        unique: usize,
        positions: &[usize],
        rows: &[f32],
    ) -> Result<Array2<f32>> {
        let dim = self.spec.dimension;

        if rows.len() != unique * dim {
            return Err(WorkerErr::Protocol(format!(
                "got {} values for {unique} rows of sparse table {} of dimension {dim}",
                rows.len(),
                self.spec.name
            )));
        }

        Ok(Array2::from_shape_fn((positions.len(), dim), |(i, j)| {
            rows[positions[i] * dim + j]
        }))
    }
}

/// Splits `indices` into its distinct ids, in order of first appearance, and the slot of
/// every index among them.
pub(super) fn dedup(indices: &[u64]) -> (Vec<u64>, Vec<usize>) {
    let mut slots = HashMap::with_capacity(indices.len());
    let mut unique = Vec::new();

    let positions = indices
        .iter()
        .map(|&id| {
            *slots.entry(id).or_insert_with(|| {
                unique.push(id);
                unique.len() - 1
            })
        })
        .collect();

    (unique, positions)
}

/// Sums the gradient rows of repeated indices.
///
/// # Returns
/// The distinct ids and their summed rows, concatenated.
pub(super) fn coalesce(indices: &[u64], grads: ArrayView2<'_, f32>) -> (Vec<u64>, Vec<f32>) {
    let (unique, positions) = dedup(indices);
    let dim = grads.ncols();
    let mut summed = vec![0.0; unique.len() * dim];

    for (row, slot) in grads.rows().into_iter().zip(positions) {
        let acc = &mut summed[slot * dim..(slot + 1) * dim];
        acc.iter_mut().zip(row).for_each(|(a, g)| *a += g);
    }

    (unique, summed)
}

#[cfg(test)]
mod tests {
    use comms::specs::InitializerSpec;
    use ndarray::array;

    use super::*;

    fn table() -> SparseTable {
        let spec = SparseTableSpec::new("emb", 2, DType::F32, InitializerSpec::constant(0.0));
        SparseTable::from_parts(Session::new(), ModelId(0), TableId(3), spec)
    }

    #[test]
    fn dedup_keeps_first_appearance_order() {
        let (unique, positions) = dedup(&[7, 3, 7, 9, 3]);
        assert_eq!(unique, [7, 3, 9]);
        assert_eq!(positions, [0, 1, 0, 2, 1]);
    }

    #[test]
    fn expand_restores_duplicates_in_order() {
        let rows = [1.0, 1.5, 2.0, 2.5];
        let out = table().expand(2, &[1, 0, 1], &rows).unwrap();
        assert_eq!(out, array![[2.0, 2.5], [1.0, 1.5], [2.0, 2.5]]);
    }

    #[test]
    fn expand_checks_row_count() {
        let result = table().expand(3, &[0, 1, 2], &[0.0; 4]);
        assert!(matches!(result, Err(WorkerErr::Protocol(_))));
    }

    #[test]
    fn coalesce_sums_repeated_rows() {
        let grads = array![[1.0, 2.0], [10.0, 20.0], [3.0, 4.0]];
        let (unique, summed) = coalesce(&[5, 8, 5], grads.view());

        assert_eq!(unique, [5, 8]);
        assert_eq!(summed, [4.0, 6.0, 10.0, 20.0]);
    }

    #[tokio::test]
    async fn gradient_rows_are_checked_before_sending() {
        let table = table();

        let grads = Array2::<f32>::zeros((2, 2));
        let result = table.push(&[1, 2, 3], grads.view()).await;
        assert!(matches!(result, Err(WorkerErr::Shape(_))));

        let grads = Array2::<f32>::zeros((3, 4));
        let result = table.push(&[1, 2, 3], grads.view()).await;
        assert!(matches!(result, Err(WorkerErr::Shape(_))));
    }
}
