//! One-directional byte copy between two endpoints

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CopyError;

pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Copy bytes from `source` to `sink` until `source` reaches EOF.
///
/// Every chunk is flushed before the next read. Returns the number of bytes
/// copied, or which side failed. The sink is not shut down on EOF; that is
/// left to the caller.
pub async fn copy<R, W>(source: &mut R, sink: &mut W) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match source.read(&mut buffer).await {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::InputSideFailure(e)),
        };

        sink.write_all(&buffer[..n])
            .await
            .map_err(CopyError::OutputSideFailure)?;
        sink.flush().await.map_err(CopyError::OutputSideFailure)?;

        total += n as u64;
    }
}
