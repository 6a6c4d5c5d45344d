use std::io;

use log::info;
use parameter_server::{Server, ServerConfig};
use tokio::signal;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = ServerConfig::from_env().map_err(io::Error::other)?;
    info!(
        "checkpoints at {}, {} sparse shards",
        config.checkpoint_dir.display(),
        config.sparse_shards
    );

    let server = Server::bind(&config).await?;

    tokio::select! {
        ret = server.run() => ret?,
        _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
    }

    Ok(())
}
