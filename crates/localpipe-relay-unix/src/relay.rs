//! Relay implementation
//!
//! One relay = one listening socket = one client. The session moves through
//! Bound → AcceptedOnce → Closed and never goes back.

use localpipe_connection::CopyError;
use localpipe_control::TaskScope;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::path::UnixSocketPath;
use crate::pipe::{pipe, CloseReason, PipeReader, PipeSink, PipeSource, PipeWriter};

/// Buffer size of the pipes created by [`listen_on_unix_socket`]
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[cfg(target_os = "linux")]
const MAX_SOCKET_PATH: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_SOCKET_PATH: usize = 104;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("Socket path already in use: {}", .path.display())]
    AddrInUse { path: PathBuf },

    #[error("Permission denied binding {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Socket path too long ({len} bytes, max {max}): {}", .path.display())]
    PathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("Failed to generate temporary socket path: {0}")]
    TempPath(#[source] io::Error),

    #[error("Unix domain sockets are not supported on this platform")]
    Unsupported,

    #[error("Failed to bind {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => BindError::AddrInUse {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => BindError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

/// The session ended without bridging a client
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Relay cancelled before a client connected")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Listening, waiting for the single client
    Bound,
    /// Client accepted, listener closed, copies running
    AcceptedOnce,
    Closed,
}

/// How one copy direction ended
#[derive(Debug)]
pub enum DirectionResult {
    /// Source reached EOF after this many bytes
    Completed(u64),
    Failed(CopyError),
    /// Stopped because the other direction failed or the scope was cancelled
    Cancelled,
}

impl DirectionResult {
    pub fn error(&self) -> Option<&CopyError> {
        match self {
            DirectionResult::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of a bridged session
#[derive(Debug)]
pub struct RelayOutcome {
    /// Client → tx sink
    pub upstream: DirectionResult,
    /// rx source → client
    pub downstream: DirectionResult,
}

/// A bound single-shot relay
#[derive(Debug)]
pub struct UnixRelay {
    socket_path: PathBuf,
    session_id: Uuid,
    state: Arc<Mutex<RelayState>>,
    session: JoinHandle<Result<RelayOutcome, SessionError>>,
}

impl UnixRelay {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> RelayState {
        self.state.lock().map(|s| *s).unwrap_or(RelayState::Closed)
    }

    /// Wait for the session to end. Both pipe endpoints have been closed by
    /// the time this returns.
    pub async fn wait(self) -> Result<RelayOutcome, SessionError> {
        match self.session.await {
            Ok(result) => result,
            Err(e) => {
                warn!(session_id = %self.session_id, "Relay session task failed: {}", e);
                Err(SessionError::Cancelled)
            }
        }
    }
}

/// A relay bridged to in-memory pipes
#[derive(Debug)]
pub struct UnixRelayHandle {
    pub relay: UnixRelay,
    /// Bytes written by the client
    pub client_output: PipeReader,
    /// Bytes to deliver to the client
    pub client_input: PipeWriter,
}

/// Bind a relay socket backed by fresh in-memory pipes
pub fn listen_on_unix_socket(
    scope: &TaskScope,
    path: UnixSocketPath,
) -> Result<UnixRelayHandle, BindError> {
    let (tx, client_output) = pipe(DEFAULT_PIPE_CAPACITY);
    let (client_input, rx) = pipe(DEFAULT_PIPE_CAPACITY);
    let relay = listen_on_unix_socket_with(scope, path, tx, rx)?;
    Ok(UnixRelayHandle {
        relay,
        client_output,
        client_input,
    })
}

/// Bind a relay socket bridging the single client to `tx` and `rx`.
///
/// The relay takes custody of both endpoints: each is closed exactly once,
/// including when binding fails.
#[cfg(unix)]
pub fn listen_on_unix_socket_with<S, R>(
    scope: &TaskScope,
    path: UnixSocketPath,
    mut tx: S,
    mut rx: R,
) -> Result<UnixRelay, BindError>
where
    S: PipeSink,
    R: PipeSource,
{
    let bound = path
        .resolve()
        .map_err(BindError::TempPath)
        .and_then(|socket_path| {
            let listener = bind_with_stale_retry(&socket_path)?;
            Ok((socket_path, listener))
        });

    let (socket_path, listener) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            let reason = CloseReason::Aborted {
                message: e.to_string(),
            };
            tx.close_pipe(reason.clone());
            rx.close_pipe(reason);
            return Err(e);
        }
    };

    let session_id = Uuid::new_v4();
    let state = Arc::new(Mutex::new(RelayState::Bound));
    info!(session_id = %session_id, "Relay listening on {}", socket_path.display());

    let session = scope.spawn_cooperative(session::run(session::Session {
        id: session_id,
        listener,
        socket_path: socket_path.clone(),
        tx,
        rx,
        state: state.clone(),
        scope: scope.clone(),
    }));

    Ok(UnixRelay {
        socket_path,
        session_id,
        state,
        session,
    })
}

#[cfg(not(unix))]
pub fn listen_on_unix_socket_with<S, R>(
    _scope: &TaskScope,
    _path: UnixSocketPath,
    mut tx: S,
    mut rx: R,
) -> Result<UnixRelay, BindError>
where
    S: PipeSink,
    R: PipeSource,
{
    let err = BindError::Unsupported;
    let reason = CloseReason::Aborted {
        message: err.to_string(),
    };
    tx.close_pipe(reason.clone());
    rx.close_pipe(reason);
    Err(err)
}

/// Bind `path`; if it is taken by a leftover file, delete it and bind once more
#[cfg(unix)]
fn bind_with_stale_retry(path: &Path) -> Result<tokio::net::UnixListener, BindError> {
    use tokio::net::UnixListener;

    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        return Err(BindError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_SOCKET_PATH - 1,
        });
    }

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!("Removing stale socket file {}", path.display());
            std::fs::remove_file(path).map_err(|e| BindError::from_io(path, e))?;
            UnixListener::bind(path).map_err(|e| BindError::from_io(path, e))
        }
        Err(e) => Err(BindError::from_io(path, e)),
    }
}

fn set_state(state: &Mutex<RelayState>, next: RelayState) {
    if let Ok(mut s) = state.lock() {
        *s = next;
    }
}

#[cfg(unix)]
mod session {
    use super::*;
    use localpipe_connection::{copy, Connection};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    pub(super) struct Session<S, R> {
        pub id: Uuid,
        pub listener: UnixListener,
        pub socket_path: PathBuf,
        pub tx: S,
        pub rx: R,
        pub state: Arc<Mutex<RelayState>>,
        pub scope: TaskScope,
    }

    pub(super) async fn run<S, R>(session: Session<S, R>) -> Result<RelayOutcome, SessionError>
    where
        S: PipeSink,
        R: PipeSource,
    {
        let Session {
            id,
            listener,
            socket_path,
            mut tx,
            mut rx,
            state,
            scope,
        } = session;

        let accepted = tokio::select! {
            accepted = listener.accept() => Some(accepted),
            _ = scope.cancelled() => None,
        };

        // Single shot: nobody else can connect from here on
        drop(listener);

        let Some(accepted) = accepted else {
            debug!(session_id = %id, "Relay cancelled while waiting for a client");
            tx.close_pipe(CloseReason::Cancelled);
            rx.close_pipe(CloseReason::Cancelled);
            finish(&socket_path, &state);
            return Err(SessionError::Cancelled);
        };

        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(session_id = %id, "Relay accept failed: {}", e);
                let reason = CloseReason::Aborted {
                    message: e.to_string(),
                };
                tx.close_pipe(reason.clone());
                rx.close_pipe(reason);
                finish(&socket_path, &state);
                return Err(SessionError::Accept(e));
            }
        };

        set_state(&state, RelayState::AcceptedOnce);
        info!(session_id = %id, "Relay client connected on {}", socket_path.display());

        let (mut client_read, mut client_write) = tokio::io::split(Connection::from_unix(stream));
        let directions = scope.child();

        let upstream = async {
            let result = tokio::select! {
                result = copy(&mut client_read, &mut tx) => result,
                _ = directions.cancelled() => return DirectionResult::Cancelled,
            };
            match result {
                Ok(n) => {
                    if let Err(e) = tx.shutdown().await {
                        debug!(session_id = %id, "tx shutdown failed: {}", e);
                    }
                    DirectionResult::Completed(n)
                }
                Err(e) => {
                    warn!(session_id = %id, "client → tx copy failed: {}", e);
                    directions.cancel();
                    DirectionResult::Failed(e)
                }
            }
        };

        let downstream = async {
            let result = tokio::select! {
                result = copy(&mut rx, &mut client_write) => result,
                _ = directions.cancelled() => return DirectionResult::Cancelled,
            };
            match result {
                Ok(n) => {
                    if let Err(e) = client_write.shutdown().await {
                        debug!(session_id = %id, "Client half-close failed: {}", e);
                    }
                    DirectionResult::Completed(n)
                }
                Err(e) => {
                    warn!(session_id = %id, "rx → client copy failed: {}", e);
                    directions.cancel();
                    DirectionResult::Failed(e)
                }
            }
        };

        let (upstream, downstream) = tokio::join!(upstream, downstream);

        tx.close_pipe(close_reason(&upstream, &downstream));
        rx.close_pipe(close_reason(&downstream, &upstream));

        let mut client = client_read.unsplit(client_write);
        client.close().await;
        finish(&socket_path, &state);

        info!(
            session_id = %id,
            upstream = ?upstream,
            downstream = ?downstream,
            "Relay session ended"
        );

        Ok(RelayOutcome {
            upstream,
            downstream,
        })
    }

    /// Reason for closing the endpoint served by `own`; a failure of either
    /// direction wins over a clean end
    fn close_reason(own: &DirectionResult, other: &DirectionResult) -> CloseReason {
        if let Some(e) = own.error().or(other.error()) {
            return CloseReason::from(e);
        }
        match (own, other) {
            (DirectionResult::Cancelled, _) | (_, DirectionResult::Cancelled) => {
                CloseReason::Cancelled
            }
            _ => CloseReason::Eof,
        }
    }

    fn finish(socket_path: &Path, state: &Mutex<RelayState>) {
        if let Err(e) = std::fs::remove_file(socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Failed to remove socket file {}: {}", socket_path.display(), e);
            }
        }
        set_state(state, RelayState::Closed);
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_close_reason_prefers_own_failure() {
            let own = DirectionResult::Failed(CopyError::InputSideFailure(io::Error::from(
                io::ErrorKind::ConnectionReset,
            )));
            let other = DirectionResult::Failed(CopyError::OutputSideFailure(io::Error::from(
                io::ErrorKind::BrokenPipe,
            )));

            match close_reason(&own, &other) {
                CloseReason::Failed { kind, .. } => {
                    assert_eq!(kind, io::ErrorKind::ConnectionReset)
                }
                r => panic!("unexpected reason: {:?}", r),
            }
        }

        #[test]
        fn test_close_reason_takes_other_failure() {
            let own = DirectionResult::Cancelled;
            let other = DirectionResult::Failed(CopyError::InputSideFailure(io::Error::from(
                io::ErrorKind::ConnectionReset,
            )));

            assert!(matches!(
                close_reason(&own, &other),
                CloseReason::Failed { .. }
            ));
        }

        #[test]
        fn test_close_reason_clean_and_cancelled() {
            assert_eq!(
                close_reason(&DirectionResult::Completed(3), &DirectionResult::Completed(0)),
                CloseReason::Eof
            );
            assert_eq!(
                close_reason(&DirectionResult::Completed(3), &DirectionResult::Cancelled),
                CloseReason::Cancelled
            );
        }
    }
}
