use std::{fmt, sync::Arc};

use comms::{
    msg::{CheckpointStatus, Command, Msg},
    specs::{DType, ModelId, OptimizerSpec, SparseTableSpec, TableId},
};
use log::{debug, info};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::ToSocketAddrs,
    sync::{MappedMutexGuard, Mutex, MutexGuard},
};

use crate::{
    error::{Result, WorkerErr},
    net::PsClient,
};

/// A connection to a parameter server, shared by every model and table built on it.
///
/// Clones refer to the same connection. Requests from different clones are serialized, so
/// replies can never be mixed up. Every operation fails with `WorkerErr::Connection` while
/// the session is not connected.
#[derive(Clone, Default)]
pub struct Session {
    client: Arc<Mutex<Option<PsClient>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a new, disconnected, `Session`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `Session` connected to `endpoint`.
    pub async fn open<A>(endpoint: A) -> Result<Self>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let session = Self::new();
        session.connect(endpoint).await?;
        Ok(session)
    }

    /// Connects to the parameter server listening on `endpoint`.
    ///
    /// # Errors
    /// `WorkerErr::Connection` if the session is already connected or the endpoint can't be
    /// reached.
    pub async fn connect<A>(&self, endpoint: A) -> Result<()>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let target = endpoint.to_string();
        let mut client = self.client.lock().await;

        if client.is_some() {
            return Err(WorkerErr::Connection(format!(
                "already connected, refusing to connect to {target}"
            )));
        }

        let conn = PsClient::connect(endpoint)
            .await
            .map_err(|e| WorkerErr::Connection(format!("failed to reach {target}: {e}")))?;

        *client = Some(conn);
        info!(endpoint = target.as_str(); "connected to parameter server");
        Ok(())
    }

    /// Connects the session through an already established stream.
    ///
    /// # Errors
    /// `WorkerErr::Connection` if the session is already connected.
    pub async fn attach<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut client = self.client.lock().await;

        if client.is_some() {
            return Err(WorkerErr::Connection("already connected".into()));
        }

        *client = Some(PsClient::from_stream(stream));
        Ok(())
    }

    /// Releases the connection, every model and table using this session becomes unusable.
    pub async fn disconnect(&self) -> Result<()> {
        let client = self.client.lock().await.take().ok_or_else(not_connected)?;
        client.disconnect().await?;
        info!("disconnected from parameter server");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn client(&self) -> Result<MappedMutexGuard<'_, PsClient>> {
        MutexGuard::try_map(self.client.lock().await, Option::as_mut).map_err(|_| not_connected())
    }

    /// Registers a model under `name`, trained with `optimizer`.
    ///
    /// # Errors
    /// `WorkerErr::Registration` if the server rejects the optimizer.
    pub async fn register_model(&self, name: &str, optimizer: &OptimizerSpec) -> Result<ModelId> {
        let cmd = Command::RegisterModel {
            name: name.to_string(),
            optimizer: optimizer.clone(),
        };

        let reply = self
            .client()
            .await?
            .register(&Msg::Control(cmd))
            .await?;

        match reply {
            Command::ModelRegistered { model_id } => {
                info!(model_id = model_id.0; "registered model {name}");
                Ok(model_id)
            }
            other => Err(unexpected("register_model", &other)),
        }
    }

    /// Broadcasts the learning rate of a model, never answered.
    pub async fn set_learning_rate(&self, model_id: ModelId, lr: f32) -> Result<()> {
        let msg = Msg::Control(Command::SetLearningRate { model_id, lr });
        self.client().await?.send(&msg).await?;
        debug!(model_id = model_id.0, lr = lr; "learning rate sent");
        Ok(())
    }

    /// Registers a dense table seeded with `initial`, laid out in row major order.
    ///
    /// A table that already exists with the same name, shape and dtype keeps its values.
    ///
    /// # Errors
    /// `WorkerErr::Shape` if `initial` doesn't hold as many values as `shape` describes,
    /// `WorkerErr::Registration` if the server rejects the table.
    pub async fn register_dense_table(
        &self,
        model_id: ModelId,
        name: &str,
        shape: &[usize],
        dtype: DType,
        initial: &[f32],
    ) -> Result<TableId> {
        let expected: usize = shape.iter().product();
        if expected != initial.len() {
            return Err(WorkerErr::Shape(format!(
                "dense table {name} has shape {shape:?} but {} initial values",
                initial.len()
            )));
        }

        let msg = Msg::Data {
            cmd: Command::RegisterDenseTable {
                model_id,
                name: name.to_string(),
                shape: shape.to_vec(),
                dtype,
            },
            nums: initial,
        };

        let reply = self.client().await?.register(&msg).await?;
        let table_id = single_table("register_dense_table", reply)?;
        debug!(model_id = model_id.0, table_id = table_id.0; "registered dense table {name}");
        Ok(table_id)
    }

    /// Sends the gradient of a dense table, never answered.
    pub async fn push_dense(&self, model_id: ModelId, table_id: TableId, grad: &[f32]) -> Result<()> {
        let msg = Msg::Data {
            cmd: Command::PushDense { model_id, table_id },
            nums: grad,
        };

        self.client().await?.send(&msg).await
    }

    /// Fetches the current values of a dense table.
    pub async fn pull_dense(&self, model_id: ModelId, table_id: TableId) -> Result<Vec<f32>> {
        let mut values = self.combine_pull_dense(model_id, &[table_id]).await?;
        values
            .pop()
            .ok_or_else(|| WorkerErr::Protocol("pull_dense returned no values".into()))
    }

    /// Applies the gradient of a dense table right away and returns its new values.
    pub async fn push_pull_dense(
        &self,
        model_id: ModelId,
        table_id: TableId,
        grad: &[f32],
    ) -> Result<Vec<f32>> {
        let msg = Msg::Data {
            cmd: Command::PushPullDense { model_id, table_id },
            nums: grad,
        };

        let mut values = self.client().await?.values(&msg, 1).await?;
        values
            .pop()
            .ok_or_else(|| WorkerErr::Protocol("push_pull_dense returned no values".into()))
    }

    /// Fetches the current values of several dense tables in a single round trip.
    ///
    /// # Returns
    /// One run of values per table, in the order of `table_ids`.
    pub async fn combine_pull_dense(
        &self,
        model_id: ModelId,
        table_ids: &[TableId],
    ) -> Result<Vec<Vec<f32>>> {
        let msg = Msg::Control(Command::PullDense {
            model_id,
            table_ids: table_ids.to_vec(),
        });

        self.client().await?.values(&msg, table_ids.len()).await
    }

    /// Registers a single sparse table.
    pub async fn register_sparse_table(
        &self,
        model_id: ModelId,
        spec: SparseTableSpec,
    ) -> Result<TableId> {
        let table_ids = self.register_combine_table(model_id, vec![spec]).await?;

        match table_ids.as_slice() {
            &[table_id] => Ok(table_id),
            ids => Err(WorkerErr::Protocol(format!(
                "register_sparse_table returned {} tables",
                ids.len()
            ))),
        }
    }

    /// Registers a group of sparse tables as a single request.
    ///
    /// # Returns
    /// The table ids, index aligned with `specs`.
    pub async fn register_combine_table(
        &self,
        model_id: ModelId,
        specs: Vec<SparseTableSpec>,
    ) -> Result<Vec<TableId>> {
        let count = specs.len();
        let cmd = Command::RegisterSparseTables { model_id, specs };
        let reply = self
            .client()
            .await?
            .register(&Msg::Control(cmd))
            .await?;

        match reply {
            Command::TablesRegistered { table_ids } if table_ids.len() == count => {
                debug!(model_id = model_id.0; "registered sparse tables {table_ids:?}");
                Ok(table_ids)
            }
            Command::TablesRegistered { table_ids } => Err(WorkerErr::Protocol(format!(
                "registered {count} sparse tables but got {} ids",
                table_ids.len()
            ))),
            other => Err(unexpected("register_sparse_tables", &other)),
        }
    }

    /// Fetches one row per index, duplicates included, in the order of `indices`.
    ///
    /// # Returns
    /// The rows concatenated.
    pub async fn pull_sparse(
        &self,
        model_id: ModelId,
        table_id: TableId,
        indices: &[u64],
    ) -> Result<Vec<f32>> {
        let mut rows = self
            .combine_pull_sparse(model_id, &[table_id], vec![indices.to_vec()])
            .await?;

        rows.pop()
            .ok_or_else(|| WorkerErr::Protocol("pull_sparse returned no rows".into()))
    }

    /// Sends row gradients of a sparse table, never answered.
    ///
    /// Gradients of an index repeated in `indices` are summed by the server.
    pub async fn push_sparse(
        &self,
        model_id: ModelId,
        table_id: TableId,
        indices: &[u64],
        grads: &[f32],
    ) -> Result<()> {
        self.combine_push_sparse(model_id, &[table_id], vec![indices.to_vec()], &[grads])
            .await
    }

    /// Fetches rows of several sparse tables in a single round trip.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if `table_ids` and `indices` differ in length.
    pub async fn combine_pull_sparse(
        &self,
        model_id: ModelId,
        table_ids: &[TableId],
        indices: Vec<Vec<u64>>,
    ) -> Result<Vec<Vec<f32>>> {
        check_operands("combine_pull_sparse", table_ids.len(), &[indices.len()])?;

        let msg = Msg::Control(Command::PullSparse {
            model_id,
            table_ids: table_ids.to_vec(),
            indices,
        });

        self.client().await?.values(&msg, table_ids.len()).await
    }

    /// Sends row gradients of several sparse tables in a single request, never answered.
    ///
    /// # Errors
    /// `WorkerErr::UnsupportedOperation` if `table_ids`, `indices` and `grads` differ in length.
    pub async fn combine_push_sparse<G>(
        &self,
        model_id: ModelId,
        table_ids: &[TableId],
        indices: Vec<Vec<u64>>,
        grads: &[G],
    ) -> Result<()>
    where
        G: AsRef<[f32]>,
    {
        check_operands(
            "combine_push_sparse",
            table_ids.len(),
            &[indices.len(), grads.len()],
        )?;

        let nums: Vec<f32> = grads.iter().flat_map(|g| g.as_ref()).copied().collect();
        let msg = Msg::Data {
            cmd: Command::PushSparse {
                model_id,
                table_ids: table_ids.to_vec(),
                indices,
            },
            nums: &nums,
        };

        self.client().await?.send(&msg).await
    }

    /// Asks the server to write a checkpoint of the whole model.
    pub async fn save(&self, model_id: ModelId) -> Result<CheckpointStatus> {
        self.checkpoint(Command::Save { model_id }).await
    }

    /// Asks the server to restore the last checkpoint of the model.
    pub async fn load(&self, model_id: ModelId) -> Result<CheckpointStatus> {
        self.checkpoint(Command::Load { model_id }).await
    }

    async fn checkpoint(&self, cmd: Command) -> Result<CheckpointStatus> {
        let name = cmd.name();

        match self.client().await?.control(cmd).await? {
            Command::Checkpoint { status } => Ok(status),
            other => Err(unexpected(name, &other)),
        }
    }
}

fn not_connected() -> WorkerErr {
    WorkerErr::Connection("the session is not connected".into())
}

fn unexpected(request: &str, reply: &Command) -> WorkerErr {
    WorkerErr::Protocol(format!("unexpected reply to {request}: {}", reply.name()))
}

fn single_table(request: &str, reply: Command) -> Result<TableId> {
    match reply {
        Command::TablesRegistered { table_ids } => match table_ids.as_slice() {
            &[table_id] => Ok(table_id),
            ids => Err(WorkerErr::Protocol(format!(
                "{request} returned {} tables",
                ids.len()
            ))),
        },
        other => Err(unexpected(request, &other)),
    }
}

fn check_operands(op: &str, tables: usize, others: &[usize]) -> Result<()> {
    match others.iter().find(|&&len| len != tables) {
        Some(len) => Err(WorkerErr::UnsupportedOperation(format!(
            "{op} got {tables} tables but an operand list of length {len}"
        ))),
        None => Ok(()),
    }
}
