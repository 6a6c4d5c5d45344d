use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use comms::specs::{DType, ModelId, OptimizerSpec, SparseTableSpec, TableId};
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::{
    checkpoint::{ModelSnapshot, TableSnapshot},
    error::{PsErr, Result},
    initialization,
    optimization::OptimizerConfig,
    storage::{DenseTable, SizeMismatchErr, SparseTable},
};

/// A registered table of either kind.
#[derive(Clone)]
pub enum Table {
    Dense(Arc<DenseTable>),
    Sparse(Arc<SparseTable>),
}

impl Table {
    fn name(&self) -> &str {
        match self {
            Table::Dense(table) => table.name(),
            Table::Sparse(table) => &table.spec().name,
        }
    }
}

#[derive(Default)]
struct Tables {
    list: Vec<Table>,
    by_name: HashMap<String, TableId>,
}

impl Tables {
    fn get(&self, id: TableId) -> Option<&Table> {
        usize::try_from(id.0).ok().and_then(|i| self.list.get(i))
    }

    fn insert(&mut self, table: Table) -> TableId {
        let id = TableId(self.list.len() as u64);
        self.by_name.insert(table.name().to_string(), id);
        self.list.push(table);
        id
    }
}

/// Marks a model as busy saving or loading, released on drop.
pub struct CheckpointGuard(Arc<ModelEntry>);

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        self.0.checkpointing.store(false, Ordering::Release);
    }
}

/// Server side state of a registered model: its optimizer, learning rate and tables.
pub struct ModelEntry {
    id: ModelId,
    name: String,
    spec: OptimizerSpec,
    optimizer: OptimizerConfig,
    lr: AtomicU32,
    seed: Option<u64>,
    sparse_shards: NonZeroUsize,
    tables: RwLock<Tables>,
    checkpointing: AtomicBool,
}

impl ModelEntry {
    /// Creates a new `ModelEntry` without tables and a zero learning rate.
    pub fn new(
        id: ModelId,
        name: String,
        spec: OptimizerSpec,
        optimizer: OptimizerConfig,
        seed: Option<u64>,
        sparse_shards: NonZeroUsize,
    ) -> Self {
        Self {
            id,
            name,
            spec,
            optimizer,
            lr: AtomicU32::new(0f32.to_bits()),
            seed,
            sparse_shards,
            tables: RwLock::new(Tables::default()),
            checkpointing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn optimizer_spec(&self) -> &OptimizerSpec {
        &self.spec
    }

    pub fn lr(&self) -> f32 {
        f32::from_bits(self.lr.load(Ordering::Acquire))
    }

    pub fn set_lr(&self, lr: f32) -> Result<()> {
        if !lr.is_finite() || lr < 0. {
            return Err(PsErr::BadRequest(format!("invalid learning rate {lr}")));
        }

        self.lr.store(lr.to_bits(), Ordering::Release);
        debug!(model_id = self.id.0; "learning rate set to {lr}");
        Ok(())
    }

    fn table_seed(&self, table: &str) -> Option<u64> {
        // FNV-1a, stable across runs so seeded tables are reproducible.
        let hash = table.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });

        self.seed.map(|seed| seed ^ hash)
    }

    /// Registers a dense table or returns the existing one of the same name.
    ///
    /// # Returns
    /// A `Registration` error if a table of that name exists with another kind, shape or dtype.
    pub fn register_dense(
        &self,
        name: &str,
        shape: Vec<usize>,
        dtype: DType,
        values: &[f32],
    ) -> Result<TableId> {
        let mut tables = self.tables.write();

        if let Some(&id) = tables.by_name.get(name) {
            return match tables.get(id) {
                Some(Table::Dense(table)) if table.matches(&shape, dtype) => Ok(id),
                Some(Table::Dense(table)) => Err(PsErr::Registration(format!(
                    "dense table {name} exists with shape {:?} and dtype {}",
                    table.shape(),
                    table.dtype()
                ))),
                _ => Err(PsErr::Registration(format!(
                    "{name} is already registered as a sparse table"
                ))),
            };
        }

        let optimizer = self.optimizer.build(values.len());
        let table = DenseTable::new(name.to_string(), shape, dtype, values.to_vec(), optimizer)?;
        let id = tables.insert(Table::Dense(Arc::new(table)));

        info!(model_id = self.id.0, table_id = id.0; "registered dense table {name}");
        Ok(id)
    }

    /// Registers a group of sparse tables, either all of them or none.
    ///
    /// Tables that already exist with the same dimension and dtype keep their rows.
    pub fn register_sparse(&self, specs: &[SparseTableSpec]) -> Result<Vec<TableId>> {
        enum Slot {
            Existing(TableId),
            New(SparseTable),
        }

        let mut tables = self.tables.write();
        let mut slots = Vec::with_capacity(specs.len());

        for (i, spec) in specs.iter().enumerate() {
            if spec.dimension == 0 {
                return Err(PsErr::Registration(format!(
                    "sparse table {} must have a positive dimension",
                    spec.name
                )));
            }

            if specs[..i].iter().any(|other| other.name == spec.name) {
                return Err(PsErr::Registration(format!(
                    "sparse table {} is listed twice",
                    spec.name
                )));
            }

            if let Some(&id) = tables.by_name.get(&spec.name) {
                match tables.get(id) {
                    Some(Table::Sparse(table))
                        if table.dimension() == spec.dimension
                            && table.spec().dtype == spec.dtype =>
                    {
                        slots.push(Slot::Existing(id));
                        continue;
                    }
                    _ => {
                        return Err(PsErr::Registration(format!(
                            "table {} already exists with another kind, dimension or dtype",
                            spec.name
                        )));
                    }
                }
            }

            let initializer = initialization::from_spec(
                &spec.initializer,
                spec.dimension,
                self.table_seed(&spec.name),
            )
            .map_err(|e| PsErr::Registration(format!("sparse table {}: {e}", spec.name)))?;

            slots.push(Slot::New(SparseTable::new(
                spec.clone(),
                initializer,
                self.optimizer,
                self.sparse_shards,
            )));
        }

        let ids = slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Existing(id) => id,
                Slot::New(table) => {
                    let name = table.spec().name.clone();
                    let id = tables.insert(Table::Sparse(Arc::new(table)));
                    info!(model_id = self.id.0, table_id = id.0; "registered sparse table {name}");
                    id
                }
            })
            .collect();

        Ok(ids)
    }

    fn table(&self, id: TableId) -> Result<Table> {
        self.tables
            .read()
            .get(id)
            .cloned()
            .ok_or(PsErr::UnknownTable {
                model_id: self.id,
                table_id: id,
            })
    }

    fn dense(&self, id: TableId) -> Result<Arc<DenseTable>> {
        match self.table(id)? {
            Table::Dense(table) => Ok(table),
            Table::Sparse(_) => Err(PsErr::BadRequest(format!("{id} is a sparse table"))),
        }
    }

    fn sparse(&self, id: TableId) -> Result<Arc<SparseTable>> {
        match self.table(id)? {
            Table::Sparse(table) => Ok(table),
            Table::Dense(_) => Err(PsErr::BadRequest(format!("{id} is a dense table"))),
        }
    }

    pub fn push_dense(&self, id: TableId, grad: &[f32]) -> Result<()> {
        self.dense(id)?.push(grad, self.lr())?;
        Ok(())
    }

    /// Appends the values of every table in `ids` to `out`.
    ///
    /// # Returns
    /// The amount of values appended per table.
    pub fn pull_dense(&self, ids: &[TableId], out: &mut Vec<f32>) -> Result<Vec<usize>> {
        let tables = ids
            .iter()
            .map(|&id| self.dense(id))
            .collect::<Result<Vec<_>>>()?;

        Ok(tables.iter().map(|table| table.pull_into(out)).collect())
    }

    pub fn push_pull_dense(&self, id: TableId, grad: &[f32], out: &mut Vec<f32>) -> Result<usize> {
        Ok(self.dense(id)?.push_pull_into(grad, self.lr(), out)?)
    }

    /// Appends the requested rows of every table in `ids` to `out`.
    ///
    /// # Returns
    /// The amount of values appended per table.
    pub fn pull_sparse(
        &self,
        ids: &[TableId],
        indices: &[Vec<u64>],
        out: &mut Vec<f32>,
    ) -> Result<Vec<usize>> {
        if ids.len() != indices.len() {
            return Err(PsErr::BadRequest(format!(
                "{} tables but {} index lists",
                ids.len(),
                indices.len()
            )));
        }

        let tables = ids
            .iter()
            .map(|&id| self.sparse(id))
            .collect::<Result<Vec<_>>>()?;

        Ok(tables
            .iter()
            .zip(indices)
            .map(|(table, indices)| table.pull_into(indices, out))
            .collect())
    }

    /// Applies the concatenated gradient rows in `grads` to every table in `ids`.
    ///
    /// Everything is validated before the first table is touched.
    pub fn push_sparse(&self, ids: &[TableId], indices: &[Vec<u64>], grads: &[f32]) -> Result<()> {
        if ids.len() != indices.len() {
            return Err(PsErr::BadRequest(format!(
                "{} tables but {} index lists",
                ids.len(),
                indices.len()
            )));
        }

        let tables = ids
            .iter()
            .map(|&id| self.sparse(id))
            .collect::<Result<Vec<_>>>()?;

        let lens: Vec<usize> = tables
            .iter()
            .zip(indices)
            .map(|(table, indices)| table.dimension() * indices.len())
            .collect();

        let expected = lens.iter().sum();
        if expected != grads.len() {
            return Err(SizeMismatchErr {
                expected,
                got: grads.len(),
            }
            .into());
        }

        let lr = self.lr();
        let mut rest = grads;

        for ((table, indices), len) in tables.iter().zip(indices).zip(lens) {
            let (grads, tail) = rest.split_at(len);
            table.push(indices, grads, lr)?;
            rest = tail;
        }

        Ok(())
    }

    /// Marks the model as checkpointing.
    ///
    /// # Returns
    /// `None` if a save or load of this model is already running.
    pub fn try_begin_checkpoint(self: &Arc<Self>) -> Option<CheckpointGuard> {
        self.checkpointing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| CheckpointGuard(Arc::clone(self)))
    }

    /// Copies every table of the model.
    pub fn snapshot(&self) -> ModelSnapshot {
        let tables = self
            .tables
            .read()
            .list
            .iter()
            .map(|table| match table {
                Table::Dense(table) => TableSnapshot::Dense {
                    name: table.name().to_string(),
                    shape: table.shape().to_vec(),
                    dtype: table.dtype(),
                    values: table.snapshot(),
                },
                Table::Sparse(table) => {
                    let (ids, values) = table.snapshot();
                    TableSnapshot::Sparse {
                        spec: table.spec().clone(),
                        ids,
                        values,
                    }
                }
            })
            .collect();

        ModelSnapshot {
            name: self.name.clone(),
            optimizer: self.spec.clone(),
            tables,
        }
    }

    /// Restores every registered table found in `snapshot`.
    ///
    /// Nothing is written unless every registered table present in the snapshot agrees
    /// with it on kind, shape or dimension, and dtype.
    pub fn restore(&self, snapshot: &ModelSnapshot) -> Result<()> {
        let tables = self.tables.read();
        let by_name: HashMap<&str, &TableSnapshot> = snapshot
            .tables
            .iter()
            .map(|table| (table.name(), table))
            .collect();

        let mut matched = Vec::new();

        for table in &tables.list {
            let Some(&saved) = by_name.get(table.name()) else {
                warn!(model_id = self.id.0; "table {} is not in the checkpoint, keeping it", table.name());
                continue;
            };

            let compatible = match (table, saved) {
                (Table::Dense(table), TableSnapshot::Dense { shape, dtype, .. }) => {
                    table.matches(shape, *dtype)
                }
                (Table::Sparse(table), TableSnapshot::Sparse { spec, .. }) => {
                    table.dimension() == spec.dimension && table.spec().dtype == spec.dtype
                }
                _ => false,
            };

            if !compatible {
                return Err(PsErr::Checkpoint(format!(
                    "table {} doesn't match its checkpoint",
                    table.name()
                )));
            }

            matched.push((table, saved));
        }

        for (table, saved) in &matched {
            match (table, saved) {
                (Table::Dense(table), TableSnapshot::Dense { values, .. }) => {
                    table.restore(values)?
                }
                (Table::Sparse(table), TableSnapshot::Sparse { ids, values, .. }) => {
                    table.restore(ids, values)?
                }
                _ => {}
            }
        }

        info!(model_id = self.id.0, tables = matched.len(); "restored {} from checkpoint", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::InitializerSpec;

    use super::*;

    fn model() -> Arc<ModelEntry> {
        let spec = OptimizerSpec::sgd();
        let optimizer = OptimizerConfig::from_spec(&spec).unwrap();
        let shards = NonZeroUsize::new(2).unwrap();
        let model = ModelEntry::new(ModelId(0), "m".into(), spec, optimizer, Some(7), shards);
        model.set_lr(0.5).unwrap();
        Arc::new(model)
    }

    fn emb(name: &str, dimension: usize) -> SparseTableSpec {
        SparseTableSpec::new(name, dimension, DType::F32, InitializerSpec::constant(0.))
    }

    #[test]
    fn dense_registration_is_idempotent_per_shape() {
        let model = model();

        let id = model.register_dense("w", vec![2], DType::F32, &[1., 2.]).unwrap();
        let again = model.register_dense("w", vec![2], DType::F32, &[5., 5.]).unwrap();
        assert_eq!(id, again);

        let mut out = Vec::new();
        model.pull_dense(&[id], &mut out).unwrap();
        assert_eq!(out, [1., 2.]);

        let err = model.register_dense("w", vec![1, 2], DType::F32, &[1., 2.]);
        assert!(matches!(err, Err(PsErr::Registration(_))));
    }

    #[test]
    fn sparse_group_is_all_or_nothing() {
        let model = model();

        let bad = [emb("a", 4), emb("b", 0)];
        assert!(model.register_sparse(&bad).is_err());

        let ids = model.register_sparse(&[emb("a", 4), emb("b", 2)]).unwrap();
        assert_eq!(ids, [TableId(0), TableId(1)]);

        let again = model.register_sparse(&[emb("b", 2)]).unwrap();
        assert_eq!(again, [TableId(1)]);

        assert!(model.register_sparse(&[emb("a", 8)]).is_err());
        assert!(model.register_sparse(&[emb("c", 1), emb("c", 1)]).is_err());
    }

    #[test]
    fn push_sparse_splits_concatenated_gradients() {
        let model = model();
        let ids = model.register_sparse(&[emb("a", 1), emb("b", 2)]).unwrap();

        let indices = vec![vec![3], vec![1, 1]];
        model.push_sparse(&ids, &indices, &[2., 1., 1., 1., 1.]).unwrap();

        let mut out = Vec::new();
        let lens = model.pull_sparse(&ids, &indices, &mut out).unwrap();
        assert_eq!(lens, [1, 4]);
        assert_eq!(out, [-1., -1., -1., -1., -1.]);

        assert!(model.push_sparse(&ids, &indices, &[1.; 4]).is_err());
    }

    #[test]
    fn kinds_are_checked() {
        let model = model();
        let dense = model.register_dense("w", vec![1], DType::F32, &[0.]).unwrap();
        let sparse = model.register_sparse(&[emb("e", 1)]).unwrap();

        assert!(model.push_dense(sparse[0], &[1.]).is_err());
        assert!(model.pull_sparse(&[dense], &[vec![0]], &mut Vec::new()).is_err());
        assert!(model.push_dense(TableId(99), &[1.]).is_err());
    }

    #[test]
    fn checkpoint_guard_is_exclusive() {
        let model = model();

        let guard = model.try_begin_checkpoint();
        assert!(guard.is_some());
        assert!(model.try_begin_checkpoint().is_none());

        drop(guard);
        assert!(model.try_begin_checkpoint().is_some());
    }

    #[test]
    fn snapshot_restore() {
        let model = model();
        let dense = model.register_dense("w", vec![2], DType::F32, &[1., 1.]).unwrap();
        let sparse = model.register_sparse(&[emb("e", 2)]).unwrap();
        model.pull_sparse(&sparse, &[vec![4]], &mut Vec::new()).unwrap();

        let snapshot = model.snapshot();

        model.push_dense(dense, &[2., 2.]).unwrap();
        model.push_sparse(&sparse, &[vec![9]], &[1., 1.]).unwrap();
        model.restore(&snapshot).unwrap();

        assert_eq!(model.snapshot(), snapshot);
    }
}
