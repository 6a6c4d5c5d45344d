//! A single node parameter server holding dense and sparse tables for the training clients.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod initialization;
pub mod optimization;
pub mod service;
pub mod storage;

pub use config::ServerConfig;
pub use error::{PsErr, Result};
pub use service::Server;
