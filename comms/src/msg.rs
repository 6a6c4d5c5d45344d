use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::{DType, ModelId, OptimizerSpec, SparseTableSpec, TableId},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const DATA_KIND: Header = 2;

/// Outcome of a checkpoint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Done,
    /// Another save or load of the same model is still running, retry later.
    Pending,
}

/// The command carried by the `Control` and `Data` variants of `Msg`.
///
/// Requests that carry numbers (initial values, gradients) travel as `Msg::Data`
/// with the numbers as the payload, everything else travels as `Msg::Control`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    RegisterModel {
        name: String,
        optimizer: OptimizerSpec,
    },
    SetLearningRate {
        model_id: ModelId,
        lr: f32,
    },
    RegisterDenseTable {
        model_id: ModelId,
        name: String,
        shape: Vec<usize>,
        dtype: DType,
    },
    RegisterSparseTables {
        model_id: ModelId,
        specs: Vec<SparseTableSpec>,
    },
    PushDense {
        model_id: ModelId,
        table_id: TableId,
    },
    PullDense {
        model_id: ModelId,
        table_ids: Vec<TableId>,
    },
    PushPullDense {
        model_id: ModelId,
        table_id: TableId,
    },
    PullSparse {
        model_id: ModelId,
        table_ids: Vec<TableId>,
        indices: Vec<Vec<u64>>,
    },
    PushSparse {
        model_id: ModelId,
        table_ids: Vec<TableId>,
        indices: Vec<Vec<u64>>,
    },
    Save {
        model_id: ModelId,
    },
    Load {
        model_id: ModelId,
    },
    Disconnect,

    ModelRegistered {
        model_id: ModelId,
    },
    TablesRegistered {
        table_ids: Vec<TableId>,
    },
    /// The payload holds one run of numbers per entry of `lens`, in request order.
    Values {
        lens: Vec<usize>,
    },
    Checkpoint {
        status: CheckpointStatus,
    },
    /// Sent instead of the reply to a request when an earlier fire and forget request
    /// failed, the answered request itself was not executed.
    Deferred {
        request: String,
        error: String,
    },
}

impl Command {
    /// Whether the peer answers this request. Fire and forget requests are never answered.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Command::SetLearningRate { .. } | Command::PushDense { .. } | Command::PushSparse { .. }
        )
    }

    /// A short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::RegisterModel { .. } => "register_model",
            Command::SetLearningRate { .. } => "set_learning_rate",
            Command::RegisterDenseTable { .. } => "register_dense_table",
            Command::RegisterSparseTables { .. } => "register_sparse_tables",
            Command::PushDense { .. } => "push_dense",
            Command::PullDense { .. } => "pull_dense",
            Command::PushPullDense { .. } => "push_pull_dense",
            Command::PullSparse { .. } => "pull_sparse",
            Command::PushSparse { .. } => "push_sparse",
            Command::Save { .. } => "save",
            Command::Load { .. } => "load",
            Command::Disconnect => "disconnect",
            Command::ModelRegistered { .. } => "model_registered",
            Command::TablesRegistered { .. } => "tables_registered",
            Command::Values { .. } => "values",
            Command::Checkpoint { .. } => "checkpoint",
            Command::Deferred { .. } => "deferred",
        }
    }
}

/// The application layer message for the entire system.
///
/// A `Data` frame is laid out as the kind header, the length of the json encoded
/// command, the command itself padded to a multiple of four bytes and finally the
/// raw numbers, so they can be viewed in place on the receiving end.
#[derive(Debug)]
pub enum Msg<'a> {
    Err(Cow<'a, str>),
    Control(Command),
    Data { cmd: Command, nums: &'a [f32] },
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }

    fn write_header(buf: &mut Vec<u8>, kind: Header) {
        buf.extend_from_slice(&kind.to_be_bytes());
    }

    fn read_header(buf: &[u8]) -> io::Result<(Header, &[u8])> {
        let Some((head, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        };

        Ok((Header::from_be_bytes(*head), rest))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                Self::write_header(buf, ERR_KIND);
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                Self::write_header(buf, CONTROL_KIND);
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Data { cmd, nums } => {
                Self::write_header(buf, DATA_KIND);

                let len_at = buf.len();
                Self::write_header(buf, 0);

                let start = buf.len();
                serde_json::to_writer(&mut *buf, cmd)?;

                let cmd_len = buf.len() - start;
                let cmd_len_header = Header::try_from(cmd_len)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

                buf[len_at..start].copy_from_slice(&cmd_len_header.to_be_bytes());
                buf.resize(start + cmd_len.next_multiple_of(HEADER_SIZE), 0);

                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let (kind, rest) = Self::read_header(buf)?;

        match kind {
            ERR_KIND => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            DATA_KIND => {
                let (cmd_len, rest) = Self::read_header(rest)?;
                let cmd_len = cmd_len as usize;
                let padded = cmd_len.next_multiple_of(HEADER_SIZE);

                if rest.len() < padded {
                    return Self::buf_is_too_small(rest.len(), padded);
                }

                let cmd = serde_json::from_slice(&rest[..cmd_len])?;
                let nums = bytemuck::try_cast_slice(&rest[padded..])
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}")))?;

                Ok(Self::Data { cmd, nums })
            }
            kind => Self::invalid_kind(kind),
        }
    }
}
