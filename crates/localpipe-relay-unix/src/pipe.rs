//! Pipe endpoints handed to the relay
//!
//! The relay writes client bytes into a [`PipeSink`] and reads bytes for the
//! client from a [`PipeSource`]. When the session ends it closes each
//! endpoint exactly once with a [`CloseReason`], so whoever holds the other
//! end learns why the stream stopped.
//!
//! [`pipe`] builds an in-memory pipe whose two ends share that reason.

use localpipe_connection::{CopyError, CopySide};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Why a pipe endpoint was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream ended normally
    Eof,
    /// The owning scope was cancelled
    Cancelled,
    /// The relay never bridged a client (bind or accept failed)
    Aborted { message: String },
    /// A copy direction failed
    Failed {
        side: CopySide,
        kind: io::ErrorKind,
        message: String,
    },
}

impl CloseReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::Eof)
    }

    /// Error surfaced to the holder of the other pipe end
    pub fn to_io_error(&self) -> io::Error {
        match self {
            CloseReason::Eof => io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"),
            CloseReason::Cancelled => {
                io::Error::new(io::ErrorKind::ConnectionAborted, "relay cancelled")
            }
            CloseReason::Aborted { message } => {
                io::Error::new(io::ErrorKind::ConnectionAborted, message.clone())
            }
            CloseReason::Failed {
                side,
                kind,
                message,
            } => io::Error::new(*kind, format!("{} side failed: {}", side, message)),
        }
    }
}

impl From<&CopyError> for CloseReason {
    fn from(err: &CopyError) -> Self {
        CloseReason::Failed {
            side: err.side(),
            kind: err.cause().kind(),
            message: err.cause().to_string(),
        }
    }
}

/// Byte sink the relay writes client data into
pub trait PipeSink: AsyncWrite + Unpin + Send + 'static {
    /// Release the endpoint. Called once per session.
    fn close_pipe(&mut self, reason: CloseReason);
}

/// Byte source the relay reads client-bound data from
pub trait PipeSource: AsyncRead + Unpin + Send + 'static {
    /// Release the endpoint. Called once per session.
    fn close_pipe(&mut self, reason: CloseReason);
}

#[derive(Debug, Default)]
struct CloseRecord {
    reason: Option<CloseReason>,
    count: usize,
}

type SharedRecord = Arc<Mutex<CloseRecord>>;

fn record_close(record: &SharedRecord, reason: CloseReason) {
    if let Ok(mut r) = record.lock() {
        r.count += 1;
        if r.reason.is_none() {
            r.reason = Some(reason);
        }
    }
}

fn failure_of(record: &SharedRecord) -> Option<io::Error> {
    let r = record.lock().ok()?;
    match &r.reason {
        Some(reason) if reason.is_failure() => Some(reason.to_io_error()),
        _ => None,
    }
}

/// Create an in-memory pipe buffering up to `capacity` bytes
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (write_half, read_half) = tokio::io::duplex(capacity.max(1));
    let record = SharedRecord::default();
    (
        PipeWriter {
            inner: Some(write_half),
            record: record.clone(),
        },
        PipeReader {
            inner: Some(read_half),
            record,
        },
    )
}

macro_rules! close_info {
    ($ty:ty) => {
        impl $ty {
            /// Reason recorded by the first close of either end
            pub fn close_reason(&self) -> Option<CloseReason> {
                self.record.lock().ok().and_then(|r| r.reason.clone())
            }

            /// How many times an end of this pipe was closed
            pub fn close_count(&self) -> usize {
                self.record.lock().map(|r| r.count).unwrap_or(0)
            }
        }
    };
}

/// Writing end of an in-memory pipe
#[derive(Debug)]
pub struct PipeWriter {
    inner: Option<DuplexStream>,
    record: SharedRecord,
}

close_info!(PipeWriter);

impl PipeWriter {
    fn closed_error(&self) -> io::Error {
        failure_of(&self.record)
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Err(this.closed_error()));
        };
        match Pin::new(inner).poll_write(cx, buf) {
            Poll::Ready(Err(_)) => Poll::Ready(Err(this.closed_error())),
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl PipeSink for PipeWriter {
    fn close_pipe(&mut self, reason: CloseReason) {
        record_close(&self.record, reason);
        self.inner = None;
    }
}

/// Reading end of an in-memory pipe
///
/// Once the writer is gone, a failure recorded on the pipe is returned as an
/// error instead of a bare EOF.
#[derive(Debug)]
pub struct PipeReader {
    inner: Option<DuplexStream>,
    record: SharedRecord,
}

close_info!(PipeReader);

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Err(failure_of(&this.record).unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "pipe closed")
            })));
        };

        let before = buf.filled().len();
        match Pin::new(inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                match failure_of(&this.record) {
                    Some(err) => Poll::Ready(Err(err)),
                    None => Poll::Ready(Ok(())),
                }
            }
            other => other,
        }
    }
}

impl PipeSource for PipeReader {
    fn close_pipe(&mut self, reason: CloseReason) {
        record_close(&self.record, reason);
        self.inner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bytes_flow_through() {
        let (mut writer, mut reader) = pipe(64);

        writer.write_all(b"hello").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.close_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_close_with_eof() {
        let (mut writer, mut reader) = pipe(64);

        writer.write_all(b"done").await.unwrap();
        writer.close_pipe(CloseReason::Eof);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"done");
        assert_eq!(reader.close_reason(), Some(CloseReason::Eof));
        assert_eq!(reader.close_count(), 1);
    }

    #[tokio::test]
    async fn test_sink_close_with_failure_surfaces_cause() {
        let (mut writer, mut reader) = pipe(64);

        writer.write_all(b"part").await.unwrap();
        let cause = CopyError::InputSideFailure(io::Error::from(io::ErrorKind::ConnectionReset));
        writer.close_pipe(CloseReason::from(&cause));

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"part");

        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("input side failed"));
    }

    #[tokio::test]
    async fn test_source_close_breaks_writer() {
        let (mut writer, mut reader) = pipe(64);

        reader.close_pipe(CloseReason::Cancelled);

        let err = writer.write_all(b"nobody listening").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(writer.close_reason(), Some(CloseReason::Cancelled));
        assert_eq!(writer.close_count(), 1);
    }

    #[test]
    fn test_reason_from_copy_error() {
        let err = CopyError::OutputSideFailure(io::Error::from(io::ErrorKind::BrokenPipe));
        match CloseReason::from(&err) {
            CloseReason::Failed { side, kind, .. } => {
                assert_eq!(side, CopySide::Output);
                assert_eq!(kind, io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected reason: {:?}", other),
        }
        assert!(!CloseReason::Eof.is_failure());
        assert!(CloseReason::Cancelled.is_failure());
    }
}
