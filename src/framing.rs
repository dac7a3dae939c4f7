//! Length-prefixed frames: `[8-byte big-endian length N][N bytes of payload]`.
//!
//! The length prefix excludes itself. Frames above [`MAX_FRAME_SIZE`] are
//! rejected before any payload allocation, and every read or write carries a
//! [`FRAME_IO_TIMEOUT`] deadline so a stalled peer cannot pin a connection.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Largest accepted frame payload (1 MiB).
pub const MAX_FRAME_SIZE: u64 = 1024 * 1024;

/// Deadline applied to each frame read and each frame write.
pub const FRAME_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Write one framed payload to the stream.
pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = data.len() as u64;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {len} bytes exceeds maximum frame size");
    }

    timeout(FRAME_IO_TIMEOUT, async {
        stream.write_u64(len).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .context("frame write deadline expired")??;
    Ok(())
}

/// Read one framed payload from the stream.
///
/// Consumes exactly the announced number of payload bytes or fails; a short
/// read is an error, never a truncated frame.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = timeout(FRAME_IO_TIMEOUT, stream.read_u64())
        .await
        .context("frame read deadline expired")??;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {len} bytes exceeds maximum frame size");
    }

    let mut payload = vec![0u8; len as usize];
    timeout(FRAME_IO_TIMEOUT, stream.read_exact(&mut payload))
        .await
        .context("frame read deadline expired")??;
    Ok(payload)
}
