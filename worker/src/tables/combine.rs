use comms::specs::{DType, InitializerSpec, ModelId, SparseTableSpec, TableId};
use ndarray::{Array2, ArrayView2};

use super::sparse::{SparseTable, coalesce, dedup};
use crate::{
    error::{Result, WorkerErr},
    session::Session,
};

/// An ordered group of sparse tables that are always pulled and pushed together.
#[derive(Debug, Clone)]
pub struct CombineTable {
    session: Session,
    model_id: ModelId,
    name: String,
    members: Vec<SparseTable>,
}

impl CombineTable {
    /// Registers every member table in a single request.
    ///
    /// # Arguments
    /// * `session` - The connection the tables are reached through.
    /// * `model_id` - The model the tables belong to.
    /// * `name` - A local name for the group.
    /// * `specs` - One descriptor per member table.
    pub async fn register(
        session: &Session,
        model_id: ModelId,
        name: &str,
        specs: Vec<SparseTableSpec>,
    ) -> Result<Self> {
        let table_ids = session
            .register_combine_table(model_id, specs.clone())
            .await?;

        let members = specs
            .into_iter()
            .zip(table_ids)
            .map(|(spec, table_id)| {
                SparseTable::from_parts(session.clone(), model_id, table_id, spec)
            })
            .collect();

        Ok(Self::from_parts(session.clone(), model_id, name, members))
    }

    pub(crate) fn from_parts(
        session: Session,
        model_id: ModelId,
        name: &str,
        members: Vec<SparseTable>,
    ) -> Self {
        Self {
            session,
            model_id,
            name: name.to_string(),
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[SparseTable] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.members.iter().map(SparseTable::id).collect()
    }

    /// Fetches the rows of every member in one round trip.
    ///
    /// # Arguments
    /// * `indices` - The row ids to fetch, one list per member.
    ///
    /// # Returns
    /// One array per member with a row per requested index, in order.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if there isn't exactly one index list per member.
    pub async fn pull<I: AsRef<[u64]>>(&self, indices: &[I]) -> Result<Vec<Array2<f32>>> {
        self.check_operands("pull", indices.len())?;

        let (uniques, positions): (Vec<_>, Vec<_>) =
            indices.iter().map(|ids| dedup(ids.as_ref())).unzip();

        let counts: Vec<_> = uniques.iter().map(Vec::len).collect();
        let rows = self
            .session
            .combine_pull_sparse(self.model_id, &self.table_ids(), uniques)
            .await?;

        self.members
            .iter()
            .zip(counts)
            .zip(positions.iter().zip(&rows))
            .map(|((table, count), (positions, rows))| table.expand(count, positions, rows))
            .collect()
    }

    /// Sends the gradient rows of every member in a single request.
    ///
    /// # Arguments
    /// * `indices` - The row ids, one list per member.
    /// * `grads` - One gradient row per index, one array per member.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if there isn't one index list and one gradient
    /// array per member, `WorkerErr::Shape` if a gradient array doesn't match its indices.
    pub async fn push<I: AsRef<[u64]>>(&self, indices: &[I], grads: &[ArrayView2<'_, f32>]) -> Result<()> {
        self.check_push(indices, grads)?;

        let (uniques, summed): (Vec<_>, Vec<_>) = indices
            .iter()
            .zip(grads)
            .map(|(ids, grad)| coalesce(ids.as_ref(), grad.view()))
            .unzip();

        self.session
            .combine_push_sparse(self.model_id, &self.table_ids(), uniques, &summed)
            .await
    }

    /// Checks the operands of a push without sending anything.
    pub(crate) fn check_push<I: AsRef<[u64]>>(
        &self,
        indices: &[I],
        grads: &[ArrayView2<'_, f32>],
    ) -> Result<()> {
        self.check_operands("push", indices.len())?;
        self.check_operands("push", grads.len())?;

        for ((table, ids), grad) in self.members.iter().zip(indices).zip(grads) {
            table.check_grads(ids.as_ref().len(), grad)?;
        }

        Ok(())
    }

    fn check_operands(&self, op: &str, len: usize) -> Result<()> {
        if len != self.members.len() {
            return Err(WorkerErr::UnsupportedOperation(format!(
                "{op} on combine table {} of {} members got {len} operands",
                self.name,
                self.members.len()
            )));
        }

        Ok(())
    }
}

/// Builds the member descriptors of a combine table from per member lists.
///
/// Missing dtypes default to `f32` and missing initializers to a standard normal.
///
/// # Errors
/// `WorkerErr::UnsupportedOperation` if the lists that are present differ in length.
pub fn combine_specs(
    names: &[&str],
    dimensions: &[usize],
    dtypes: Option<&[DType]>,
    initializers: Option<&[InitializerSpec]>,
) -> Result<Vec<SparseTableSpec>> {
    let n = names.len();
    let lens = [
        Some(dimensions.len()),
        dtypes.map(<[_]>::len),
        initializers.map(<[_]>::len),
    ];

    if let Some(len) = lens.into_iter().flatten().find(|&len| len != n) {
        return Err(WorkerErr::UnsupportedOperation(format!(
            "combine table member lists differ in length: {n} names, a list of {len}"
        )));
    }

    let specs = (0..n)
        .map(|i| {
            SparseTableSpec::new(
                names[i],
                dimensions[i],
                dtypes.map(|d| d[i]).unwrap_or_default(),
                initializers.map_or_else(|| InitializerSpec::normal(0.0, 1.0), |inits| inits[i].clone()),
            )
        })
        .collect();

    Ok(specs)
}
