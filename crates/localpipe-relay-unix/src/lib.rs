//! Single-shot Unix-domain-socket relay
//!
//! Creates a listening Unix socket, accepts exactly one client and bridges it
//! to a pair of byte pipes: everything the client writes goes to the `tx`
//! sink, everything read from the `rx` source goes back to the client.
//!
//! ```ignore
//! let scope = TaskScope::new();
//! let handle = listen_on_unix_socket(&scope, UnixSocketPath::temporary("relay-", ".sock"))?;
//! println!("connect to {}", handle.relay.socket_path().display());
//! ```

pub mod path;
pub mod pipe;
pub mod relay;

pub use path::{TempPathSpec, UnixSocketPath};
pub use pipe::{pipe, CloseReason, PipeReader, PipeSink, PipeSource, PipeWriter};
pub use relay::{
    listen_on_unix_socket, listen_on_unix_socket_with, BindError, DirectionResult, RelayOutcome,
    RelayState, SessionError, UnixRelay, UnixRelayHandle, DEFAULT_PIPE_CAPACITY,
};
