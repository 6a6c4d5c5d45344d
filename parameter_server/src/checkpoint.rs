//! On disk persistence of whole models.
//!
//! A checkpoint is a directory named after the hex encoded model name holding a
//! `meta.json` manifest and one raw native endian file per table buffer.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use bytemuck::Pod;
use comms::specs::{DType, OptimizerSpec, SparseTableSpec};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{PsErr, Result};

const MANIFEST: &str = "meta.json";

/// The values of one table at the time of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSnapshot {
    Dense {
        name: String,
        shape: Vec<usize>,
        dtype: DType,
        values: Vec<f32>,
    },
    Sparse {
        spec: SparseTableSpec,
        ids: Vec<u64>,
        values: Vec<f32>,
    },
}

impl TableSnapshot {
    pub fn name(&self) -> &str {
        match self {
            TableSnapshot::Dense { name, .. } => name,
            TableSnapshot::Sparse { spec, .. } => &spec.name,
        }
    }
}

/// A consistent copy of every table of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub name: String,
    pub optimizer: OptimizerSpec,
    pub tables: Vec<TableSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    model: String,
    optimizer: OptimizerSpec,
    tables: Vec<TableEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TableEntry {
    Dense {
        name: String,
        shape: Vec<usize>,
        dtype: DType,
        values: String,
    },
    Sparse {
        spec: SparseTableSpec,
        rows: usize,
        ids: String,
        values: String,
    },
}

/// Reads and writes model checkpoints below a root directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Creates a new `CheckpointStore`, the root directory is created lazily on save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory of `model`, its name hex encoded so distinct names never collide.
    fn dir_name(model: &str) -> String {
        model.bytes().map(|b| format!("{b:02x}")).collect()
    }

    /// Where the previous checkpoint waits while a save swaps in the new one.
    fn old_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{name}.old"))
    }

    /// Writes `snapshot`, replacing any previous checkpoint of the same model.
    ///
    /// The files are written to a temporary directory first. The previous checkpoint is
    /// renamed aside before the new one is renamed into place and only removed after, a
    /// crash mid save leaves one of them on disk and `load` falls back to the set aside one.
    pub fn save(&self, snapshot: &ModelSnapshot) -> Result<()> {
        let name = Self::dir_name(&snapshot.name);
        let dir = self.root.join(&name);
        let old = self.old_dir(&name);
        let tmp = self.root.join(format!(".{name}.tmp"));

        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let mut tables = Vec::with_capacity(snapshot.tables.len());

        for (i, table) in snapshot.tables.iter().enumerate() {
            let entry = match table {
                TableSnapshot::Dense {
                    name,
                    shape,
                    dtype,
                    values,
                } => {
                    let file = format!("{i}.values");
                    fs::write(tmp.join(&file), bytemuck::cast_slice::<f32, u8>(values))?;

                    TableEntry::Dense {
                        name: name.clone(),
                        shape: shape.clone(),
                        dtype: *dtype,
                        values: file,
                    }
                }
                TableSnapshot::Sparse { spec, ids, values } => {
                    let ids_file = format!("{i}.ids");
                    let values_file = format!("{i}.values");
                    fs::write(tmp.join(&ids_file), bytemuck::cast_slice::<u64, u8>(ids))?;
                    fs::write(tmp.join(&values_file), bytemuck::cast_slice::<f32, u8>(values))?;

                    TableEntry::Sparse {
                        spec: spec.clone(),
                        rows: ids.len(),
                        ids: ids_file,
                        values: values_file,
                    }
                }
            };

            tables.push(entry);
        }

        let manifest = Manifest {
            model: snapshot.name.clone(),
            optimizer: snapshot.optimizer.clone(),
            tables,
        };

        fs::write(tmp.join(MANIFEST), serde_json::to_vec_pretty(&manifest)?)?;

        if dir.exists() {
            if old.exists() {
                fs::remove_dir_all(&old)?;
            }
            fs::rename(&dir, &old)?;
        }
        fs::rename(&tmp, &dir)?;

        if old.exists() {
            fs::remove_dir_all(&old)?;
        }

        info!(tables = snapshot.tables.len(); "saved checkpoint of {} to {}", snapshot.name, dir.display());
        Ok(())
    }

    /// Reads the last checkpoint of `model`.
    ///
    /// # Returns
    /// A `Checkpoint` error if there is none, it's inconsistent or it belongs to
    /// another model.
    pub fn load(&self, model: &str) -> Result<ModelSnapshot> {
        let name = Self::dir_name(model);
        let mut dir = self.root.join(&name);

        if !dir.join(MANIFEST).exists() {
            let old = self.old_dir(&name);
            if old.join(MANIFEST).exists() {
                debug!("using the set aside checkpoint of {model}");
                dir = old;
            }
        }

        let manifest = match fs::read(dir.join(MANIFEST)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PsErr::Checkpoint(format!("no checkpoint for model {model}")));
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = serde_json::from_slice(&manifest)?;
        if manifest.model != model {
            return Err(PsErr::Checkpoint(format!(
                "checkpoint at {} belongs to model {}, not {model}",
                dir.display(),
                manifest.model
            )));
        }
        debug!("reading checkpoint of {model} from {}", dir.display());

        let tables = manifest
            .tables
            .into_iter()
            .map(|entry| match entry {
                TableEntry::Dense {
                    name,
                    shape,
                    dtype,
                    values,
                } => {
                    let values: Vec<f32> = read_pod(&dir.join(values))?;

                    if values.len() != shape.iter().product::<usize>() {
                        return Err(PsErr::Checkpoint(format!(
                            "dense table {name} holds {} values for shape {shape:?}",
                            values.len()
                        )));
                    }

                    Ok(TableSnapshot::Dense {
                        name,
                        shape,
                        dtype,
                        values,
                    })
                }
                TableEntry::Sparse {
                    spec,
                    rows,
                    ids,
                    values,
                } => {
                    let ids: Vec<u64> = read_pod(&dir.join(ids))?;
                    let values: Vec<f32> = read_pod(&dir.join(values))?;

                    if ids.len() != rows || values.len() != rows * spec.dimension {
                        return Err(PsErr::Checkpoint(format!(
                            "sparse table {} is truncated",
                            spec.name
                        )));
                    }

                    Ok(TableSnapshot::Sparse { spec, ids, values })
                }
            })
            .collect::<Result<_>>()?;

        Ok(ModelSnapshot {
            name: manifest.model,
            optimizer: manifest.optimizer,
            tables,
        })
    }
}

fn read_pod<T: Pod>(path: &Path) -> Result<Vec<T>> {
    let bytes = fs::read(path)?;

    if bytes.len() % size_of::<T>() != 0 {
        return Err(PsErr::Checkpoint(format!(
            "{} has a trailing partial element",
            path.display()
        )));
    }

    Ok(bytemuck::pod_collect_to_vec(&bytes))
}
