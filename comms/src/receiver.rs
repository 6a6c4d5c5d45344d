use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// Reads frames from a stream and decodes them in place.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Reads the next frame into `buf` and decodes it.
    ///
    /// The decoded message borrows from `buf`, which is reused between calls so a steady
    /// stream of same sized frames doesn't allocate. Backing the buffer with 4 byte words
    /// lets `f32` payloads be viewed without copying.
    ///
    /// # Errors
    /// `UnexpectedEof` if the stream ends, `InvalidData` if the length prefix is over
    /// `MAX_FRAME_LEN` or the frame doesn't decode.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut prefix = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut prefix).await?;

        let len = usize::try_from(LenType::from_be_bytes(prefix))
            .ok()
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame length exceeds the limit of {MAX_FRAME_LEN}"),
                )
            })?;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let frame = &mut bytemuck::cast_slice_mut::<B, u8>(buf)[..len];
        self.rx.read_exact(frame).await?;

        T::deserialize(frame)
    }
}
