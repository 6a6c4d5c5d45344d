//! Embedding layers backed by sparse and combine tables.
//!
//! Every layer keeps what its last forward pass looked up, the following backward pass
//! pushes the row gradients of exactly those lookups and clears it. A gradient rejected
//! before anything is sent leaves the lookups in place for another attempt.

use ndarray::{Array2, ArrayView2};

use crate::{
    error::{Result, WorkerErr},
    hook::{CombineHook, SparseHook},
    jagged::{JaggedBatch, JaggedPool},
    tables::{CombineTable, SparseTable},
};

fn no_forward(layer: &str) -> WorkerErr {
    WorkerErr::UnsupportedOperation(format!("backward of {layer} without a forward pass"))
}

/// Looks up one row per index.
#[derive(Debug, Clone)]
pub struct Embedding {
    hook: SparseHook,
    saved: Option<Vec<u64>>,
}

impl Embedding {
    pub fn new(table: SparseTable) -> Self {
        Self {
            hook: SparseHook::new(table),
            saved: None,
        }
    }

    pub fn table(&self) -> &SparseTable {
        self.hook.table()
    }

    /// Pulls the rows of `indices`, duplicates included, in order.
    pub async fn forward(&mut self, indices: &[u64]) -> Result<Array2<f32>> {
        let rows = self.table().pull(indices).await?;
        self.saved = Some(indices.to_vec());
        Ok(rows)
    }

    /// Pushes one gradient row per index of the last forward pass.
    pub async fn backward(&mut self, grad: ArrayView2<'_, f32>) -> Result<()> {
        let indices = self
            .saved
            .as_deref()
            .ok_or_else(|| no_forward(self.table().name()))?;
        self.table().check_grads(indices.len(), &grad)?;

        let result = self.hook.on_rows(indices, grad).await;
        self.saved = None;
        result
    }
}

/// Looks up bags of rows and pools every bag into a single row.
#[derive(Debug, Clone)]
pub struct JaggedEmbedding {
    hook: SparseHook,
    pool: JaggedPool,
    saved: Option<JaggedBatch>,
}

impl JaggedEmbedding {
    pub fn new(table: SparseTable, pool: JaggedPool) -> Self {
        Self {
            hook: SparseHook::new(table),
            pool,
            saved: None,
        }
    }

    pub fn table(&self) -> &SparseTable {
        self.hook.table()
    }

    pub fn pool(&self) -> JaggedPool {
        self.pool
    }

    /// Pulls the rows of every bag of `batch` and pools them.
    ///
    /// # Returns
    /// One row per bag.
    pub async fn forward(&mut self, batch: &JaggedBatch) -> Result<Array2<f32>> {
        let rows = self.table().pull(batch.indices()).await?;
        let pooled = self
            .pool
            .forward(rows.view(), batch.offsets(), batch.weights())?;

        self.saved = Some(batch.clone());
        Ok(pooled)
    }

    /// Scatters one gradient row per bag onto the rows of the bag and pushes them.
    pub async fn backward(&mut self, grad: ArrayView2<'_, f32>) -> Result<()> {
        let batch = self
            .saved
            .as_ref()
            .ok_or_else(|| no_forward(self.table().name()))?;
        let grads = self
            .pool
            .backward(grad, batch.offsets(), batch.weights())?;
        self.table().check_grads(batch.indices().len(), &grads.view())?;

        let result = self.hook.on_rows(batch.indices(), grads.view()).await;
        self.saved = None;
        result
    }
}

/// Looks up rows of every member of a combine table in one round trip.
#[derive(Debug, Clone)]
pub struct CombineEmbedding {
    hook: CombineHook,
    saved: Option<Vec<Vec<u64>>>,
}

impl CombineEmbedding {
    pub fn new(table: CombineTable) -> Self {
        Self {
            hook: CombineHook::new(table),
            saved: None,
        }
    }

    pub fn table(&self) -> &CombineTable {
        self.hook.table()
    }

    /// Pulls one row per index of every member.
    ///
    /// # Arguments
    /// * `indices` - One index list per member.
    ///
    /// # Returns
    /// One array per member.
    pub async fn forward<I: AsRef<[u64]>>(&mut self, indices: &[I]) -> Result<Vec<Array2<f32>>> {
        let rows = self.table().pull(indices).await?;
        self.saved = Some(indices.iter().map(|ids| ids.as_ref().to_vec()).collect());
        Ok(rows)
    }

    /// Pushes the gradient rows of every member in one request.
    pub async fn backward(&mut self, grads: &[ArrayView2<'_, f32>]) -> Result<()> {
        let indices = self
            .saved
            .as_deref()
            .ok_or_else(|| no_forward(self.table().name()))?;
        self.table().check_push(indices, grads)?;

        let result = self.hook.on_rows(indices, grads).await;
        self.saved = None;
        result
    }
}

/// Looks up bags of rows of every member of a combine table and pools them, each member
/// with its own pooling.
#[derive(Debug, Clone)]
pub struct CombineJaggedEmbedding {
    hook: CombineHook,
    pools: Vec<JaggedPool>,
    saved: Option<Vec<JaggedBatch>>,
}

impl CombineJaggedEmbedding {
    /// Creates a new `CombineJaggedEmbedding`.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if there isn't one pool per member.
    pub fn new(table: CombineTable, pools: Vec<JaggedPool>) -> Result<Self> {
        if pools.len() != table.len() {
            return Err(WorkerErr::UnsupportedOperation(format!(
                "combine table {} has {} members but got {} poolings",
                table.name(),
                table.len(),
                pools.len()
            )));
        }

        Ok(Self {
            hook: CombineHook::new(table),
            pools,
            saved: None,
        })
    }

    pub fn table(&self) -> &CombineTable {
        self.hook.table()
    }

    pub fn pools(&self) -> &[JaggedPool] {
        &self.pools
    }

    /// Pulls the rows of every member's batch in one round trip and pools them.
    ///
    /// # Arguments
    /// * `batches` - One batch per member.
    ///
    /// # Returns
    /// One array per member with a row per bag.
    pub async fn forward(&mut self, batches: &[JaggedBatch]) -> Result<Vec<Array2<f32>>> {
        let indices: Vec<&[u64]> = batches.iter().map(JaggedBatch::indices).collect();
        let rows = self.table().pull(&indices).await?;

        let pooled = self
            .pools
            .iter()
            .zip(batches)
            .zip(&rows)
            .map(|((pool, batch), rows)| {
                pool.forward(rows.view(), batch.offsets(), batch.weights())
            })
            .collect::<Result<_>>()?;

        self.saved = Some(batches.to_vec());
        Ok(pooled)
    }

    /// Scatters the gradient of every member's bags and pushes them in one request.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if there isn't one gradient array per member,
    /// `WorkerErr::Shape` if one doesn't have a row per bag.
    pub async fn backward(&mut self, grads: &[ArrayView2<'_, f32>]) -> Result<()> {
        let batches = self
            .saved
            .as_deref()
            .ok_or_else(|| no_forward(self.table().name()))?;

        if grads.len() != batches.len() {
            return Err(WorkerErr::UnsupportedOperation(format!(
                "backward of combine table {} got {} gradients for {} members",
                self.table().name(),
                grads.len(),
                batches.len()
            )));
        }

        let scattered = self
            .pools
            .iter()
            .zip(batches)
            .zip(grads)
            .map(|((pool, batch), grad)| {
                pool.backward(grad.view(), batch.offsets(), batch.weights())
            })
            .collect::<Result<Vec<_>>>()?;

        let indices: Vec<&[u64]> = batches.iter().map(JaggedBatch::indices).collect();
        let views: Vec<_> = scattered.iter().map(|grads| grads.view()).collect();
        self.table().check_push(&indices, &views)?;

        let result = self.hook.on_rows(&indices, &views).await;
        self.saved = None;
        result
    }
}
