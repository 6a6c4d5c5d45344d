mod connection;
mod server;

pub use connection::Connection;
pub use server::Server;
