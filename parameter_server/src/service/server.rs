use std::{io, net::SocketAddr, sync::Arc};

use comms::{OnoReceiver, OnoSender};
use log::{info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
};

use crate::{checkpoint::CheckpointStore, config::ServerConfig, service::Connection, storage::Registry};

/// The listening parameter server, it accepts clients and spawns a task per connection.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    checkpoints: Arc<CheckpointStore>,
    tasks: JoinSet<io::Result<()>>,
}

impl Server {
    /// Binds a new `Server` to the address in `config`.
    ///
    /// # Arguments
    /// * `config` - The server configuration.
    ///
    /// # Returns
    /// An `io::Error` if the address can't be bound.
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;

        Ok(Self {
            listener,
            registry: Arc::new(Registry::new(config.seed, config.sparse_shards)),
            checkpoints: Arc::new(CheckpointStore::new(&config.checkpoint_dir)),
            tasks: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves a client over an already established channel.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: OnoReceiver<R>, tx: OnoSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let conn = Connection::new(Arc::clone(&self.registry), Arc::clone(&self.checkpoints));
        self.tasks.spawn(conn.run(rx, tx));
    }

    /// Accepts clients forever, the returned future is meant to be raced against a shutdown signal.
    pub async fn run(mut self) -> io::Result<()> {
        info!("listening at {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("failed to accept a client: {e}");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("couldn't disable nagle for {addr}: {e}");
                    }
                    info!("client connected from {addr}");

                    let (rx, tx) = stream.into_split();
                    let (rx, tx) = comms::channel(rx, tx);
                    self.spawn(rx, tx);
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("connection closed with an error: {e}"),
                        Err(e) => warn!("connection task failed: {e}"),
                    }
                }
            }
        }
    }
}
