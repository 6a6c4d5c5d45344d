use std::{borrow::Cow, io, sync::Arc};

use comms::{
    OnoReceiver, OnoSender,
    msg::{CheckpointStatus, Command, Msg},
    specs::ModelId,
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task,
};

use crate::{
    checkpoint::CheckpointStore,
    error::{PsErr, Result},
    storage::Registry,
};

enum Reply {
    Control(Command),
    /// The numbers are in the connection's output buffer.
    Values(Vec<usize>),
}

/// Serves the requests of a single client, one at a time and in order.
///
/// Requests without a reply can't report their failures right away, so the first such
/// failure is kept and answers the next request that expects a reply, as a
/// `Command::Deferred` in place of that request's reply.
pub struct Connection {
    registry: Arc<Registry>,
    checkpoints: Arc<CheckpointStore>,
    deferred: Option<(&'static str, String)>,
    out: Vec<f32>,
}

impl Connection {
    /// Creates a new `Connection`.
    ///
    /// # Arguments
    /// * `registry` - The models shared by every connection.
    /// * `checkpoints` - Where models are saved to and loaded from.
    pub fn new(registry: Arc<Registry>, checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            registry,
            checkpoints,
            deferred: None,
            out: Vec::new(),
        }
    }

    /// Handles requests until the client disconnects.
    ///
    /// # Returns
    /// An `io::Error` if the underlying stream fails or a malformed frame is received.
    pub async fn run<R, W>(mut self, mut rx: OnoReceiver<R>, mut tx: OnoSender<W>) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf: Vec<u32> = Vec::new();

        loop {
            let msg: Msg = match rx.recv_into(&mut buf).await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("client hung up");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let (cmd, nums) = match msg {
                Msg::Control(cmd) => (cmd, &[][..]),
                Msg::Data { cmd, nums } => (cmd, nums),
                Msg::Err(e) => {
                    warn!("client reported an error: {e}");
                    continue;
                }
            };

            if cmd == Command::Disconnect {
                tx.send(&Msg::Control(Command::Disconnect)).await?;
                debug!("client disconnected");
                return Ok(());
            }

            let name = cmd.name();

            if !cmd.expects_reply() {
                if let Err(e) = self.apply(cmd, nums) {
                    warn!(request = name; "request failed: {e}");
                    self.deferred.get_or_insert_with(|| (name, e.to_string()));
                }

                continue;
            }

            if let Some((request, error)) = self.deferred.take() {
                let reply = Command::Deferred {
                    request: request.to_string(),
                    error,
                };
                tx.send(&Msg::Control(reply)).await?;
                continue;
            }

            self.out.clear();
            match self.handle(cmd, nums).await {
                Ok(Reply::Control(reply)) => tx.send(&Msg::Control(reply)).await?,
                Ok(Reply::Values(lens)) => {
                    let msg = Msg::Data {
                        cmd: Command::Values { lens },
                        nums: &self.out,
                    };

                    tx.send(&msg).await?;
                }
                Err(e) => {
                    debug!(request = name; "request rejected: {e}");
                    tx.send(&Msg::Err(Cow::Owned(e.to_string()))).await?;
                }
            }
        }
    }

    /// Handles the requests that are never answered.
    fn apply(&self, cmd: Command, nums: &[f32]) -> Result<()> {
        match cmd {
            Command::SetLearningRate { model_id, lr } => self.registry.model(model_id)?.set_lr(lr),
            Command::PushDense { model_id, table_id } => {
                self.registry.model(model_id)?.push_dense(table_id, nums)
            }
            Command::PushSparse {
                model_id,
                table_ids,
                indices,
            } => self
                .registry
                .model(model_id)?
                .push_sparse(&table_ids, &indices, nums),
            other => Err(PsErr::BadRequest(format!("{} expects a reply", other.name()))),
        }
    }

    async fn handle(&mut self, cmd: Command, nums: &[f32]) -> Result<Reply> {
        let reply = match cmd {
            Command::RegisterModel { name, optimizer } => {
                let model_id = self.registry.register_model(&name, optimizer)?;
                Reply::Control(Command::ModelRegistered { model_id })
            }
            Command::RegisterDenseTable {
                model_id,
                name,
                shape,
                dtype,
            } => {
                let model = self.registry.model(model_id)?;
                let table_id = model.register_dense(&name, shape, dtype, nums)?;

                Reply::Control(Command::TablesRegistered {
                    table_ids: vec![table_id],
                })
            }
            Command::RegisterSparseTables { model_id, specs } => {
                let model = self.registry.model(model_id)?;
                let table_ids = model.register_sparse(&specs)?;
                Reply::Control(Command::TablesRegistered { table_ids })
            }
            Command::PullDense {
                model_id,
                table_ids,
            } => {
                let model = self.registry.model(model_id)?;
                Reply::Values(model.pull_dense(&table_ids, &mut self.out)?)
            }
            Command::PushPullDense { model_id, table_id } => {
                let model = self.registry.model(model_id)?;
                Reply::Values(vec![model.push_pull_dense(table_id, nums, &mut self.out)?])
            }
            Command::PullSparse {
                model_id,
                table_ids,
                indices,
            } => {
                let model = self.registry.model(model_id)?;
                Reply::Values(model.pull_sparse(&table_ids, &indices, &mut self.out)?)
            }
            Command::Save { model_id } => Reply::Control(Command::Checkpoint {
                status: self.save(model_id).await?,
            }),
            Command::Load { model_id } => Reply::Control(Command::Checkpoint {
                status: self.load(model_id).await?,
            }),
            other => {
                return Err(PsErr::BadRequest(format!(
                    "{} is not a request",
                    other.name()
                )));
            }
        };

        Ok(reply)
    }

    async fn save(&self, model_id: ModelId) -> Result<CheckpointStatus> {
        let model = self.registry.model(model_id)?;
        let Some(_guard) = model.try_begin_checkpoint() else {
            return Ok(CheckpointStatus::Pending);
        };

        let snapshot = model.snapshot();
        let store = Arc::clone(&self.checkpoints);
        task::spawn_blocking(move || store.save(&snapshot)).await??;

        Ok(CheckpointStatus::Done)
    }

    async fn load(&self, model_id: ModelId) -> Result<CheckpointStatus> {
        let model = self.registry.model(model_id)?;
        let Some(_guard) = model.try_begin_checkpoint() else {
            return Ok(CheckpointStatus::Pending);
        };

        let name = model.name().to_string();
        let store = Arc::clone(&self.checkpoints);
        let snapshot = task::spawn_blocking(move || store.load(&name)).await??;

        model.restore(&snapshot)?;
        info!(model_id = model_id.0; "loaded checkpoint of {}", model.name());
        Ok(CheckpointStatus::Done)
    }
}
