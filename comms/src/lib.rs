//! Framing and message layer shared by the parameter server and its clients.
//!
//! A frame is a big endian `u64` length followed by that many bytes, see `msg::Msg` for
//! the message layout inside a frame.

mod align;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::{Align1, Align4};
pub use deserialize::Deserialize;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The longest frame either end sends or accepts, 1 GiB.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Wraps a reader and a writer into the two ends of a framed channel.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
