use std::{error::Error, fmt, io};

use ndarray::ShapeError;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Client side failures.
#[derive(Debug)]
pub enum WorkerErr {
    /// No live session, or the endpoint could not be reached.
    Connection(String),
    /// The server rejected a model or table registration, or a name or hook was bound twice.
    Registration(String),
    /// Locally detected shape violation, raised before any request is sent.
    Shape(String),
    /// Unknown pooling mode or mismatched combine operand lists.
    UnsupportedOperation(String),
    /// The server's reply doesn't match the request.
    Protocol(String),
    /// The server failed to serve a request.
    Remote(String),
    Io(io::Error),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Connection(e) => write!(f, "connection error: {e}"),
            WorkerErr::Registration(e) => write!(f, "registration error: {e}"),
            WorkerErr::Shape(e) => write!(f, "shape error: {e}"),
            WorkerErr::UnsupportedOperation(e) => write!(f, "unsupported operation: {e}"),
            WorkerErr::Protocol(e) => write!(f, "protocol error: {e}"),
            WorkerErr::Remote(e) => write!(f, "server error: {e}"),
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ShapeError> for WorkerErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value.to_string())
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            WorkerErr::Connection(_) => io::Error::new(io::ErrorKind::NotConnected, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
