use std::{
    collections::{HashMap, hash_map::Entry},
    num::NonZeroUsize,
};

use comms::specs::SparseTableSpec;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::{
    initialization::Initializer,
    optimization::{Optimizer, OptimizerConfig},
    storage::{Result, SizeMismatchErr},
};

struct Row {
    values: Box<[f32]>,
    // Built on the first push, rows that are only ever read don't pay for it.
    optimizer: Option<Box<dyn Optimizer>>,
}

/// A row addressable table keyed by integer ids.
///
/// Rows materialize on first touch through the table's initializer and are spread over
/// independently locked shards, so batched pulls and pushes run in parallel.
pub struct SparseTable {
    spec: SparseTableSpec,
    initializer: Box<dyn Initializer>,
    optimizer: OptimizerConfig,
    shards: Box<[Mutex<HashMap<u64, Row>>]>,
}

impl SparseTable {
    /// Creates a new empty `SparseTable`.
    ///
    /// # Arguments
    /// * `spec` - The table descriptor, its dimension must be positive.
    /// * `initializer` - Fills new rows.
    /// * `optimizer` - Builds the per row optimizer state.
    /// * `shards` - The amount of independently locked row maps.
    pub fn new(
        spec: SparseTableSpec,
        initializer: Box<dyn Initializer>,
        optimizer: OptimizerConfig,
        shards: NonZeroUsize,
    ) -> Self {
        let shards = (0..shards.get())
            .map(|_| Mutex::new(HashMap::new()))
            .collect();

        Self {
            spec,
            initializer,
            optimizer,
            shards,
        }
    }

    pub fn spec(&self) -> &SparseTableSpec {
        &self.spec
    }

    pub fn dimension(&self) -> usize {
        self.spec.dimension
    }

    /// The amount of materialized rows.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    fn shard(&self, id: u64) -> &Mutex<HashMap<u64, Row>> {
        &self.shards[(id % self.shards.len() as u64) as usize]
    }

    fn new_row(&self, id: u64) -> Row {
        let mut values = vec![0.; self.dimension()].into_boxed_slice();
        self.initializer.fill(id, &mut values);
        self.spec.dtype.quantize(&mut values);

        Row {
            values,
            optimizer: None,
        }
    }

    /// Appends one row per index to `out`, in the order of `indices`.
    ///
    /// Absent rows are materialized, duplicated indices are copied once per occurrence.
    pub fn pull_into(&self, indices: &[u64], out: &mut Vec<f32>) -> usize {
        let dim = self.dimension();
        let start = out.len();
        let len = indices.len() * dim;

        if len == 0 {
            return 0;
        }

        out.resize(start + len, 0.);
        out[start..]
            .par_chunks_mut(dim)
            .zip(indices.par_iter())
            .for_each(|(dst, &id)| {
                let mut shard = self.shard(id).lock();
                let row = shard.entry(id).or_insert_with(|| self.new_row(id));
                dst.copy_from_slice(&row.values);
            });

        len
    }

    /// Applies one gradient row per index.
    ///
    /// Gradients of repeated indices are summed first, so each touched row gets exactly one
    /// optimizer update.
    ///
    /// # Arguments
    /// * `indices` - The row ids.
    /// * `grads` - The gradient rows, concatenated in the order of `indices`.
    /// * `lr` - The current learning rate.
    pub fn push(&self, indices: &[u64], grads: &[f32], lr: f32) -> Result<()> {
        let dim = self.dimension();
        SizeMismatchErr::check(indices.len() * dim, grads.len())?;

        if dim == 0 {
            return Ok(());
        }

        let mut merged: HashMap<u64, Vec<f32>> = HashMap::with_capacity(indices.len());
        for (&id, grad) in indices.iter().zip(grads.chunks_exact(dim)) {
            match merged.entry(id) {
                Entry::Occupied(mut acc) => acc
                    .get_mut()
                    .iter_mut()
                    .zip(grad)
                    .for_each(|(acc, g)| *acc += g),
                Entry::Vacant(slot) => {
                    slot.insert(grad.to_vec());
                }
            }
        }

        merged.into_par_iter().try_for_each(|(id, grad)| {
            let mut shard = self.shard(id).lock();
            let row = shard.entry(id).or_insert_with(|| self.new_row(id));

            let optimizer = row
                .optimizer
                .get_or_insert_with(|| self.optimizer.build(dim));

            optimizer.update_params(&grad, lr, &mut row.values)?;
            self.spec.dtype.quantize(&mut row.values);
            Ok(())
        })
    }

    /// Copies every materialized row, sorted by id.
    ///
    /// # Returns
    /// The row ids and the concatenated row values.
    pub fn snapshot(&self) -> (Vec<u64>, Vec<f32>) {
        let mut rows: Vec<(u64, Box<[f32]>)> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .iter()
                    .map(|(&id, row)| (id, row.values.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        rows.sort_unstable_by_key(|(id, _)| *id);

        let ids = rows.iter().map(|(id, _)| *id).collect();
        let values = rows.iter().flat_map(|(_, values)| values.iter().copied()).collect();
        (ids, values)
    }

    /// Replaces every row with the given ones, dropping all optimizer state.
    pub fn restore(&self, ids: &[u64], values: &[f32]) -> Result<()> {
        let dim = self.dimension();
        SizeMismatchErr::check(ids.len() * dim, values.len())?;

        let mut shards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
        shards.iter_mut().for_each(|shard| shard.clear());

        let n = shards.len() as u64;
        for (i, &id) in ids.iter().enumerate() {
            let row = Row {
                values: values[i * dim..(i + 1) * dim].into(),
                optimizer: None,
            };

            shards[(id % n) as usize].insert(id, row);
        }

        Ok(())
    }
}
