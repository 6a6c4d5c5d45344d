use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes messages to a stream, one frame each.
pub struct OnoSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Writes `msg` as a single frame and flushes the writer.
    ///
    /// The owned part of the message is encoded into an internal buffer behind the length
    /// prefix, a borrowed payload tail is written after it as is.
    ///
    /// # Errors
    /// `InvalidInput` if the frame is longer than `MAX_FRAME_LEN`, or any error of the writer.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.buf.clear();
        self.buf.resize(LEN_TYPE_SIZE, 0);

        let tail = msg.serialize(&mut self.buf)?;
        let len = self.buf.len() - LEN_TYPE_SIZE + tail.map_or(0, <[u8]>::len);

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}"),
            ));
        }

        self.buf[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());
        self.tx.write_all(&self.buf).await?;

        if let Some(tail) = tail {
            self.tx.write_all(tail).await?;
        }

        self.tx.flush().await
    }

    /// Shuts down the writer, the peer reads an end of stream afterwards.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
