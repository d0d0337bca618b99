//! Raw byte connections over OS sockets
//!
//! Provides the [`Connection`] wrapper around one connected TCP or Unix-domain
//! socket, the outbound [`Connector`] with its connect watchdog, socket option
//! handling, and the [`copy`] primitive used to bridge two byte endpoints.

pub mod address;
pub mod connection;
pub mod connector;
pub mod copy;
pub mod error;
pub mod options;

pub use address::{AddressParseError, HostAddress, IpPreference, DEFAULT_CONNECT_TIMEOUT};
pub use connection::{Connection, ConnectionState};
pub use connector::{connect, Connector};
pub use copy::{copy, COPY_BUFFER_SIZE};
pub use error::{ConfigurationError, ConnectionError, CopyError, CopySide};
pub use options::{Linger, SocketOptions, SocketSettings};
