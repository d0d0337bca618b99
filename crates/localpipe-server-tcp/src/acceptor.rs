//! Acceptor implementation
//!
//! Lifecycle: Created (socket opened) → Listening (accept loop running) →
//! Closed. Closed is terminal; `close()` may be called any number of times.

use futures::Stream;
use localpipe_connection::{Connection, SocketOptions, SocketSettings};
use localpipe_control::TaskScope;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_BACKLOG: u32 = 1024;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    AddressUnavailable {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to configure listening socket: {0}")]
    Configure(#[source] std::io::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BindError {
    fn unavailable(addr: SocketAddr, err: std::io::Error) -> Self {
        BindError::AddressUnavailable {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("Acceptor closed")]
    Closed,

    #[error("Accept failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Created,
    Listening,
    Closed,
}

/// Acceptor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    /// Capacity of the incoming-connection queue; 0 is treated as 1
    pub queue_capacity: usize,

    /// Listen backlog passed to the OS
    pub backlog: u32,

    /// Options applied to the listening socket before bind
    pub listener: SocketSettings,

    /// Options applied to every accepted socket
    pub accepted: SocketSettings,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backlog: DEFAULT_BACKLOG,
            listener: SocketSettings {
                reuse_addr: cfg!(unix).then_some(true),
                ..Default::default()
            },
            accepted: SocketSettings::default(),
        }
    }
}

type QueueItem = Result<Connection, AcceptError>;

/// Listens on one address and publishes accepted connections
#[derive(Debug)]
pub struct Acceptor {
    local_addr: SocketAddr,
    scope: TaskScope,
    state: Arc<Mutex<AcceptorState>>,
    closed: Arc<AtomicBool>,
    incoming: Mutex<Option<Incoming>>,
    accept_task: Mutex<Option<JoinHandle<Option<()>>>>,
}

impl Acceptor {
    /// Bind and start accepting.
    ///
    /// The accept loop runs in a child of `scope`; cancelling `scope` stops it.
    pub fn bind(
        scope: &TaskScope,
        addr: SocketAddr,
        config: AcceptorConfig,
    ) -> Result<Self, BindError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        let state = Arc::new(Mutex::new(AcceptorState::Created));

        config
            .listener
            .apply(&SocketOptions::new(SockRef::from(&socket)))
            .map_err(BindError::Configure)?;
        socket
            .bind(addr)
            .map_err(|e| BindError::unavailable(addr, e))?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|e| BindError::unavailable(addr, e))?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let scope = scope.child();

        set_state(&state, AcceptorState::Listening);
        let accept_task = scope.spawn(
            "tcp-accept-loop",
            accept_loop(listener, tx, config.accepted, state.clone()),
        );

        info!("TCP acceptor listening on {}", local_addr);

        Ok(Self {
            local_addr,
            scope,
            state,
            closed: closed.clone(),
            incoming: Mutex::new(Some(Incoming { rx, closed })),
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> AcceptorState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(AcceptorState::Closed)
    }

    /// Take the incoming-connection queue.
    ///
    /// The queue is handed out once; later calls return `None`.
    pub fn incoming(&self) -> Option<Incoming> {
        self.incoming.lock().ok().and_then(|mut i| i.take())
    }

    /// Stop accepting, close the listening socket and the queue.
    ///
    /// When this returns the listening socket has been released. Calling it
    /// again is a no-op.
    pub async fn close(&self) {
        let handle = self.accept_task.lock().ok().and_then(|mut t| t.take());
        let Some(handle) = handle else {
            return;
        };

        // A loop that already stopped on an accept fault keeps the fault queued
        if self.state() != AcceptorState::Closed {
            self.closed.store(true, Ordering::SeqCst);
        }
        self.scope.cancel();
        if let Err(e) = handle.await {
            warn!("Accept loop for {} ended abnormally: {}", self.local_addr, e);
        }
        set_state(&self.state, AcceptorState::Closed);

        info!("TCP acceptor on {} closed", self.local_addr);
    }
}

fn set_state(state: &Mutex<AcceptorState>, next: AcceptorState) {
    if let Ok(mut s) = state.lock() {
        *s = next;
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<QueueItem>,
    accepted: SocketSettings,
    state: Arc<Mutex<AcceptorState>>,
) {
    loop {
        let result = tokio::select! {
            result = listener.accept() => result,
            _ = tx.closed() => {
                debug!("Incoming queue dropped, stopping accept loop");
                break;
            }
        };

        match result {
            Ok((stream, peer_addr)) => {
                debug!("Accepted TCP connection from {}", peer_addr);
                let conn = Connection::from_tcp(stream);

                if !accepted.is_empty() {
                    if let Err(e) = conn.configure(|opts| accepted.apply(opts)) {
                        warn!("Failed to configure connection from {}: {}", peer_addr, e);
                    }
                }

                // Suspends while the queue is full
                if tx.send(Ok(conn)).await.is_err() {
                    debug!("Incoming queue dropped, stopping accept loop");
                    break;
                }
            }
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
                let _ = tx.send(Err(AcceptError::Io(e))).await;
                break;
            }
        }
    }

    set_state(&state, AcceptorState::Closed);
}

/// The incoming-connection queue of an [`Acceptor`]
///
/// Yields connections in acceptance order. Ends (`None`) once the acceptor is
/// closed; an accept fault is delivered as a final `Err` item.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::Receiver<QueueItem>,
    closed: Arc<AtomicBool>,
}

impl Incoming {
    pub async fn next(&mut self) -> Option<QueueItem> {
        if self.discard_if_closed() {
            return None;
        }
        self.rx.recv().await
    }

    /// Like [`Incoming::next`], reporting the end of the queue as
    /// [`AcceptError::Closed`]
    pub async fn accept(&mut self) -> Result<Connection, AcceptError> {
        self.next().await.unwrap_or(Err(AcceptError::Closed))
    }

    /// After `close()`, connections still buffered in the queue are dropped
    /// instead of delivered
    fn discard_if_closed(&mut self) -> bool {
        if !self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            drop(item);
        }
        true
    }
}

impl Stream for Incoming {
    type Item = QueueItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.discard_if_closed() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}
