//! Client side of the parameter server: a session to the server, models and their dense,
//! sparse and combine tables, gradient routing, jagged pooling and checkpoints.

pub mod checkpoint;
pub mod embedding;
pub mod error;
pub mod hook;
pub mod jagged;
pub mod lr;
pub mod model;
pub mod net;
pub mod session;
pub mod tables;

pub use checkpoint::Checkpoint;
pub use comms::{
    msg::CheckpointStatus,
    specs::{DType, InitializerSpec, ModelId, OptimizerSpec, SparseTableSpec, TableId},
};
pub use embedding::{CombineEmbedding, CombineJaggedEmbedding, Embedding, JaggedEmbedding};
pub use error::{Result, WorkerErr};
pub use hook::{Discipline, GradHook, Parameter};
pub use jagged::{JaggedBatch, JaggedPool, Offsets, Pooling};
pub use lr::{ConstantLr, ExponentialLr, LrSchedule, StepLr};
pub use model::{Model, ModelBuilder, ParamId};
pub use session::Session;
