use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use comms::specs::{ModelId, TableId};

use crate::storage::SizeMismatchErr;

/// The parameter server's result type.
pub type Result<T> = std::result::Result<T, PsErr>;

/// Failures while serving a request. Every variant but `Io` is reported back to the
/// requesting client instead of tearing its connection down.
#[derive(Debug)]
pub enum PsErr {
    Io(io::Error),
    Json(serde_json::Error),
    UnknownModel(ModelId),
    UnknownTable { model_id: ModelId, table_id: TableId },
    Registration(String),
    InvalidConfig(String),
    SizeMismatch(SizeMismatchErr),
    BadRequest(String),
    Checkpoint(String),
}

impl Display for PsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsErr::Io(e) => write!(f, "io error: {e}"),
            PsErr::Json(e) => write!(f, "json error: {e}"),
            PsErr::UnknownModel(id) => write!(f, "unknown {id}"),
            PsErr::UnknownTable { model_id, table_id } => {
                write!(f, "unknown {table_id} in {model_id}")
            }
            PsErr::Registration(msg) => write!(f, "registration rejected: {msg}"),
            PsErr::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            PsErr::SizeMismatch(e) => write!(f, "{e}"),
            PsErr::BadRequest(msg) => write!(f, "bad request: {msg}"),
            PsErr::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
        }
    }
}

impl Error for PsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PsErr::Io(e) => Some(e),
            PsErr::Json(e) => Some(e),
            PsErr::SizeMismatch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PsErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for PsErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<SizeMismatchErr> for PsErr {
    fn from(value: SizeMismatchErr) -> Self {
        Self::SizeMismatch(value)
    }
}

impl From<tokio::task::JoinError> for PsErr {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Io(value.into())
    }
}
