//! TCP connection acceptor
//!
//! Binds a listening socket, runs the accept loop inside a caller-supplied
//! [`localpipe_control::TaskScope`] and publishes accepted
//! [`localpipe_connection::Connection`]s on a bounded queue.

mod acceptor;

pub use acceptor::{
    AcceptError, Acceptor, AcceptorConfig, AcceptorState, BindError, Incoming,
    DEFAULT_BACKLOG, DEFAULT_QUEUE_CAPACITY,
};
