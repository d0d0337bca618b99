//! A single connected socket carrying raw bytes

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;
use uuid::Uuid;

use crate::error::ConfigurationError;
use crate::options::SocketOptions;

/// Largest chunk returned by a single [`Connection::receive`]
const RECEIVE_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug)]
enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    fn sock_ref(&self) -> SockRef<'_> {
        match self {
            Socket::Tcp(s) => SockRef::from(s),
            #[cfg(unix)]
            Socket::Unix(s) => SockRef::from(s),
        }
    }
}

/// Lifecycle of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Shutdown of both directions is in progress
    Closing,
    Closed,
}

/// Exclusive owner of one connected socket
///
/// Bytes pass through unchanged, in the order the caller issues them.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    socket: Option<Socket>,
    state: ConnectionState,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self::new(Socket::Tcp(stream), peer_addr)
    }

    #[cfg(unix)]
    pub fn from_unix(stream: UnixStream) -> Self {
        Self::new(Socket::Unix(stream), None)
    }

    fn new(socket: Socket, peer_addr: Option<SocketAddr>) -> Self {
        let id = Uuid::new_v4();
        debug!(connection_id = %id, peer_addr = ?peer_addr, "Connection established");
        Self {
            id,
            socket: Some(socket),
            state: ConnectionState::Connected,
            peer_addr,
        }
    }

    /// Identifier used for log correlation
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Remote address; `None` for Unix-domain connections
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address; `None` for Unix-domain or closed connections
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.socket.as_ref()? {
            Socket::Tcp(s) => s.local_addr().ok(),
            #[cfg(unix)]
            Socket::Unix(_) => None,
        }
    }

    /// Apply socket options to the open socket.
    ///
    /// The closure gets a borrowed mutator; ownership of the socket never
    /// leaves this connection.
    pub fn configure<F, R>(&self, f: F) -> Result<R, ConfigurationError>
    where
        F: FnOnce(&SocketOptions<'_>) -> io::Result<R>,
    {
        let socket = self.socket.as_ref().ok_or(ConfigurationError::Closed)?;
        let opts = SocketOptions::new(socket.sock_ref());
        Ok(f(&opts)?)
    }

    /// Write all of `data`, suspending while the socket buffer is full
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await?;
        self.flush().await
    }

    /// Read the next chunk of available bytes; `None` once the peer has
    /// closed its sending side
    pub async fn receive(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(RECEIVE_CHUNK_SIZE);
        let n = self.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    /// Shut down only the sending direction; the peer observes EOF
    pub async fn send_half_close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Shut down sending, then receiving, then release the descriptor.
    ///
    /// Later calls are no-ops.
    pub async fn close(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        self.state = ConnectionState::Closing;

        let write_result = match &mut socket {
            Socket::Tcp(s) => s.shutdown().await,
            #[cfg(unix)]
            Socket::Unix(s) => s.shutdown().await,
        };
        if let Err(e) = write_result {
            debug!(connection_id = %self.id, "Send shutdown failed: {}", e);
        }
        if let Err(e) = socket.sock_ref().shutdown(Shutdown::Read) {
            debug!(connection_id = %self.id, "Receive shutdown failed: {}", e);
        }

        drop(socket);
        self.state = ConnectionState::Closed;
        debug!(connection_id = %self.id, "Connection closed");
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().socket.as_mut() {
            Some(Socket::Tcp(s)) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Some(Socket::Unix(s)) => Pin::new(s).poll_read(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().socket.as_mut() {
            Some(Socket::Tcp(s)) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Some(Socket::Unix(s)) => Pin::new(s).poll_write(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().socket.as_mut() {
            Some(Socket::Tcp(s)) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Some(Socket::Unix(s)) => Pin::new(s).poll_flush(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().socket.as_mut() {
            Some(Socket::Tcp(s)) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Some(Socket::Unix(s)) => Pin::new(s).poll_shutdown(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}
