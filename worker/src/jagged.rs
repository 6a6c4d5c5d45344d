//! Pooling of variable length groups of embedding rows.
//!
//! A jagged batch is a flat run of rows together with the offsets where every group
//! starts, group `i` being `rows[offsets[i]..offsets[i + 1]]`.

use std::{fmt, ops::Range, str::FromStr};

use ndarray::prelude::*;

use crate::error::{Result, WorkerErr};

/// How the rows of a group are reduced to a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pooling {
    #[default]
    Sum,
    Mean,
}

impl FromStr for Pooling {
    type Err = WorkerErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            other => Err(WorkerErr::UnsupportedOperation(format!(
                "pooling mode {other} is not supported, expected sum or mean"
            ))),
        }
    }
}

impl fmt::Display for Pooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pooling::Sum => write!(f, "sum"),
            Pooling::Mean => write!(f, "mean"),
        }
    }
}

/// Validated group boundaries: starts at zero, never decreases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offsets(Vec<usize>);

impl Offsets {
    /// Creates new `Offsets` over a batch of `rows` rows.
    ///
    /// # Errors
    /// `WorkerErr::Shape` if `offsets` is empty, doesn't start at zero, doesn't end at
    /// `rows` or decreases anywhere.
    pub fn new(offsets: Vec<usize>, rows: usize) -> Result<Self> {
        let invalid = |why: &str| {
            Err(WorkerErr::Shape(format!(
                "invalid offsets {offsets:?} for {rows} rows: {why}"
            )))
        };

        match (offsets.first(), offsets.last()) {
            (None, _) | (_, None) => return invalid("no offsets"),
            (Some(&first), _) if first != 0 => return invalid("must start at 0"),
            (_, Some(&last)) if last != rows => return invalid("must end at the row count"),
            _ => {}
        }

        if offsets.windows(2).any(|w| w[1] < w[0]) {
            return invalid("must be non-decreasing");
        }

        Ok(Self(offsets))
    }

    /// Builds the offsets of consecutive groups of the given lengths.
    pub fn from_lengths(lengths: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        offsets.push(0);

        let mut end = 0;
        for len in lengths {
            end += len;
            offsets.push(end);
        }

        Self(offsets)
    }

    /// The amount of groups.
    pub fn groups(&self) -> usize {
        self.0.len() - 1
    }

    /// The amount of rows over all groups.
    pub fn rows(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    /// The row range of every group, in order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.0.windows(2).map(|w| w[0]..w[1])
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

/// A batch of embedding lookups grouped into variable length bags.
#[derive(Debug, Clone, PartialEq)]
pub struct JaggedBatch {
    indices: Vec<u64>,
    offsets: Offsets,
    weights: Option<Vec<f32>>,
}

impl JaggedBatch {
    /// Creates a new `JaggedBatch`.
    ///
    /// # Arguments
    /// * `indices` - The row ids of every group, concatenated.
    /// * `offsets` - Where every group starts, followed by `indices.len()`.
    /// * `weights` - An optional scalar per index that scales its row before pooling.
    ///
    /// # Errors
    /// `WorkerErr::Shape` if the offsets are invalid or there isn't one weight per index.
    pub fn new(indices: Vec<u64>, offsets: Vec<usize>, weights: Option<Vec<f32>>) -> Result<Self> {
        let offsets = Offsets::new(offsets, indices.len())?;

        match &weights {
            Some(weights) if weights.len() != indices.len() => {
                return Err(WorkerErr::Shape(format!(
                    "got {} weights for {} indices",
                    weights.len(),
                    indices.len()
                )));
            }
            _ => {}
        }

        Ok(Self {
            indices,
            offsets,
            weights,
        })
    }

    /// Builds an unweighted batch with one group per item of `groups`.
    pub fn from_groups<G: AsRef<[u64]>>(groups: &[G]) -> Self {
        let lengths: Vec<_> = groups.iter().map(|g| g.as_ref().len()).collect();
        let indices = groups.iter().flat_map(|g| g.as_ref()).copied().collect();

        Self {
            indices,
            offsets: Offsets::from_lengths(&lengths),
            weights: None,
        }
    }

    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    pub fn offsets(&self) -> &Offsets {
        &self.offsets
    }

    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }
}

/// Reduces the rows of every group of a jagged batch with a pooling mode.
///
/// Empty groups pool to `patch_value` in every column and receive no gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JaggedPool {
    mode: Pooling,
    patch_value: f32,
}

impl Default for JaggedPool {
    fn default() -> Self {
        Self::new(Pooling::Sum, 0.0)
    }
}

impl JaggedPool {
    pub fn new(mode: Pooling, patch_value: f32) -> Self {
        Self { mode, patch_value }
    }

    pub fn mode(&self) -> Pooling {
        self.mode
    }

    pub fn patch_value(&self) -> f32 {
        self.patch_value
    }

    /// Pools `values` into one row per group.
    ///
    /// # Arguments
    /// * `values` - One row per index of the batch.
    /// * `offsets` - The group boundaries.
    /// * `weights` - An optional factor per row applied before pooling.
    ///
    /// # Returns
    /// An array of `offsets.groups()` rows as wide as `values`.
    pub fn forward(
        &self,
        values: ArrayView2<f32>,
        offsets: &Offsets,
        weights: Option<&[f32]>,
    ) -> Result<Array2<f32>> {
        check_rows("values", values.nrows(), offsets, weights)?;

        let mut out = Array2::from_elem((offsets.groups(), values.ncols()), self.patch_value);

        for (mut pooled, range) in out.rows_mut().into_iter().zip(offsets.ranges()) {
            if range.is_empty() {
                continue;
            }

            let len = range.len();
            pooled.fill(0.0);

            for i in range {
                match weights {
                    Some(weights) => pooled.scaled_add(weights[i], &values.row(i)),
                    None => pooled += &values.row(i),
                }
            }

            if self.mode == Pooling::Mean {
                pooled /= len as f32;
            }
        }

        Ok(out)
    }

    /// Scatters the gradient of every pooled row back onto the rows of its group.
    ///
    /// # Arguments
    /// * `grad` - One gradient row per group.
    /// * `offsets` - The group boundaries used in the forward pass.
    /// * `weights` - The weights used in the forward pass.
    ///
    /// # Returns
    /// An array with one gradient row per row of the batch.
    pub fn backward(
        &self,
        grad: ArrayView2<f32>,
        offsets: &Offsets,
        weights: Option<&[f32]>,
    ) -> Result<Array2<f32>> {
        if grad.nrows() != offsets.groups() {
            return Err(WorkerErr::Shape(format!(
                "got {} gradient rows for {} groups",
                grad.nrows(),
                offsets.groups()
            )));
        }
        check_rows("weights", offsets.rows(), offsets, weights)?;

        let mut out = Array2::zeros((offsets.rows(), grad.ncols()));

        for (g, range) in grad.rows().into_iter().zip(offsets.ranges()) {
            let len = range.len();

            for i in range {
                let mut row = out.row_mut(i);
                row.assign(&g);

                if self.mode == Pooling::Mean {
                    row /= len as f32;
                }
                if let Some(weights) = weights {
                    row *= weights[i];
                }
            }
        }

        Ok(out)
    }
}

fn check_rows(what: &str, rows: usize, offsets: &Offsets, weights: Option<&[f32]>) -> Result<()> {
    if rows != offsets.rows() {
        return Err(WorkerErr::Shape(format!(
            "got {rows} {what} rows but the offsets cover {}",
            offsets.rows()
        )));
    }

    match weights {
        Some(weights) if weights.len() != rows => Err(WorkerErr::Shape(format!(
            "got {} weights for {rows} rows",
            weights.len()
        ))),
        _ => Ok(()),
    }
}
