use comms::specs::{DType, ModelId, TableId};
use ndarray::{ArrayD, ArrayViewD, IxDyn};

use super::contiguous;
use crate::{
    error::{Result, WorkerErr},
    session::Session,
};

/// A registered dense table, a single tensor of fixed shape.
#[derive(Debug, Clone)]
pub struct DenseTable {
    session: Session,
    model_id: ModelId,
    table_id: TableId,
    name: String,
    shape: Vec<usize>,
    dtype: DType,
}

impl DenseTable {
    /// Registers a dense table seeded with `initial`.
    ///
    /// # Arguments
    /// * `session` - The connection the table is reached through.
    /// * `model_id` - The model the table belongs to.
    /// * `name` - The table name, unique within its model.
    /// * `initial` - The values the table starts with if it doesn't exist yet.
    /// * `dtype` - The storage precision on the server.
    ///
    /// # Returns
    /// The handle of the table.
    pub async fn register(
        session: &Session,
        model_id: ModelId,
        name: &str,
        initial: ArrayViewD<'_, f32>,
        dtype: DType,
    ) -> Result<Self> {
        let initial = initial.as_standard_layout();
        let table_id = session
            .register_dense_table(model_id, name, initial.shape(), dtype, contiguous(&initial)?)
            .await?;

        Ok(Self {
            session: session.clone(),
            model_id,
            table_id,
            name: name.to_string(),
            shape: initial.shape().to_vec(),
            dtype,
        })
    }

    pub fn id(&self) -> TableId {
        self.table_id
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
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

    /// Sends a gradient without waiting for it to be applied.
    pub async fn push(&self, grad: ArrayViewD<'_, f32>) -> Result<()> {
        self.check_grad(&grad)?;
        let grad = grad.as_standard_layout();

        self.session
            .push_dense(self.model_id, self.table_id, contiguous(&grad)?)
            .await
    }

    /// Fetches the current values.
    pub async fn pull(&self) -> Result<ArrayD<f32>> {
        let values = self.session.pull_dense(self.model_id, self.table_id).await?;
        self.to_array(values)
    }

    /// Applies a gradient on the server and returns the resulting values.
    pub async fn push_pull(&self, grad: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        self.check_grad(&grad)?;
        let grad = grad.as_standard_layout();

        let values = self
            .session
            .push_pull_dense(self.model_id, self.table_id, contiguous(&grad)?)
            .await?;

        self.to_array(values)
    }

    fn check_grad(&self, grad: &ArrayViewD<'_, f32>) -> Result<()> {
        if grad.shape() != self.shape.as_slice() {
            return Err(WorkerErr::Shape(format!(
                "gradient of shape {:?} for dense table {} of shape {:?}",
                grad.shape(),
                self.name,
                self.shape
            )));
        }

        Ok(())
    }

    fn to_array(&self, values: Vec<f32>) -> Result<ArrayD<f32>> {
        let len = values.len();

        ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|_| {
            WorkerErr::Protocol(format!(
                "got {len} values for dense table {} of shape {:?}",
                self.name, self.shape
            ))
        })
    }
}

/// Fetches the values of several dense tables of one model in a single round trip.
///
/// # Returns
/// The values of every table, in the order of `tables`.
///
/// # Errors
/// `WorkerErr::UnsupportedOperation` if the tables belong to different models.
pub async fn combine_pull(tables: &[&DenseTable]) -> Result<Vec<ArrayD<f32>>> {
    let Some(first) = tables.first() else {
        return Ok(Vec::new());
    };

    if tables.iter().any(|t| t.model_id != first.model_id) {
        return Err(WorkerErr::UnsupportedOperation(
            "combine pull of dense tables from different models".into(),
        ));
    }

    let ids: Vec<_> = tables.iter().map(|t| t.table_id).collect();
    let values = first
        .session
        .combine_pull_dense(first.model_id, &ids)
        .await?;

    tables
        .iter()
        .zip(values)
        .map(|(table, values)| table.to_array(values))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(session: Session) -> DenseTable {
        DenseTable {
            session,
            model_id: ModelId(0),
            table_id: TableId(0),
            name: "w".into(),
            shape: vec![2, 3],
            dtype: DType::F32,
        }
    }

    #[tokio::test]
    async fn gradient_shape_is_checked_before_sending() {
        let table = table(Session::new());
        let grad = ArrayD::<f32>::zeros(IxDyn(&[3, 2]));

        let result = table.push(grad.view()).await;
        assert!(matches!(result, Err(WorkerErr::Shape(_))));

        let result = table.push_pull(grad.view()).await;
        assert!(matches!(result, Err(WorkerErr::Shape(_))));
    }

    #[test]
    fn wrong_amount_of_values_is_a_protocol_error() {
        let table = table(Session::new());

        assert!(table.to_array(vec![0.0; 6]).is_ok());
        assert!(matches!(
            table.to_array(vec![0.0; 5]),
            Err(WorkerErr::Protocol(_))
        ));
    }
}
