use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// The fixed-size header leading every wire message: total length, the sender-assigned request
/// id, the id of the request this message responds to (0 for requests), and the flag bits.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: u32,
}

impl Header {
    pub(crate) const LENGTH: usize = 3 * std::mem::size_of::<i32>() + std::mem::size_of::<u32>();

    /// Serializes the header and writes the bytes to `stream`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        stream.write_i32_le(self.length).await?;
        stream.write_i32_le(self.request_id).await?;
        stream.write_i32_le(self.response_to).await?;
        stream.write_u32_le(self.flags).await?;

        Ok(())
    }

    /// Reads bytes from `stream` and deserializes them into a header.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self> {
        let length = stream.read_i32_le().await?;
        let request_id = stream.read_i32_le().await?;
        let response_to = stream.read_i32_le().await?;
        let flags = stream.read_u32_le().await?;

        Ok(Self {
            length,
            request_id,
            response_to,
            flags,
        })
    }
}
