//! Outbound TCP connector with a connect watchdog

use localpipe_control::TaskScope;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::HostAddress;
use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::options::SocketOptions;

/// Opens outbound connections on behalf of a [`TaskScope`]
///
/// Cancelling the scope aborts any connect attempt still in flight.
#[derive(Debug, Clone)]
pub struct Connector {
    scope: TaskScope,
}

impl Connector {
    pub fn new(scope: TaskScope) -> Self {
        Self { scope }
    }

    /// Connect to `address`, applying `configure` before the handshake starts.
    ///
    /// The attempt races the socket connect against a watchdog timer of
    /// `address.timeout()` (hostname resolution included) and against scope
    /// cancellation. The pending connect future owns the socket, so when it
    /// loses the race dropping it releases the descriptor. A connect that is
    /// ready at the same instant as the watchdog wins.
    pub async fn connect<F>(
        &self,
        address: &HostAddress,
        configure: F,
    ) -> Result<Connection, ConnectionError>
    where
        F: FnOnce(&SocketOptions<'_>) -> io::Result<()>,
    {
        let deadline = Instant::now() + address.timeout();

        let target = tokio::select! {
            biased;
            _ = self.scope.cancelled() => return Err(ConnectionError::Cancelled),
            resolved = tokio::time::timeout_at(deadline, resolve(address)) => match resolved {
                Ok(target) => target?,
                Err(_) => {
                    warn!("Resolving {} timed out", address);
                    return Err(ConnectionError::Timeout);
                }
            },
        };

        let socket = match target {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| ConnectionError::Unknown(e.to_string()))?;

        configure(&SocketOptions::new(SockRef::from(&socket)))
            .map_err(ConnectionError::Configure)?;

        debug!("Connecting to {} ({})", address, target);

        let attempt = socket.connect(target);
        tokio::pin!(attempt);

        tokio::select! {
            biased;
            result = &mut attempt => match result {
                Ok(stream) => {
                    info!("Connected to {} ({})", address, target);
                    Ok(Connection::from_tcp(stream))
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", address, e);
                    Err(ConnectionError::from_io(&e))
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    "Connect to {} timed out after {:?}, closing socket",
                    address,
                    address.timeout()
                );
                Err(ConnectionError::Timeout)
            }
            _ = self.scope.cancelled() => {
                debug!("Connect to {} cancelled", address);
                Err(ConnectionError::Cancelled)
            }
        }
    }
}

/// Connect outside of any scope; only the watchdog can abort the attempt
pub async fn connect<F>(address: &HostAddress, configure: F) -> Result<Connection, ConnectionError>
where
    F: FnOnce(&SocketOptions<'_>) -> io::Result<()>,
{
    Connector::new(TaskScope::new())
        .connect(address, configure)
        .await
}

/// Resolve the hostname and pick the first address of the preferred family
async fn resolve(address: &HostAddress) -> Result<SocketAddr, ConnectionError> {
    let resolved = tokio::net::lookup_host((address.hostname(), address.port()))
        .await
        .map_err(|e| ConnectionError::Resolve {
            host: address.hostname().to_string(),
            reason: e.to_string(),
        })?;

    address
        .ip_preference()
        .order(resolved.collect())
        .into_iter()
        .next()
        .ok_or_else(|| ConnectionError::Resolve {
            host: address.hostname().to_string(),
            reason: "no addresses found".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::IpPreference;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_success_applies_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let address = HostAddress::new("127.0.0.1", port).with_timeout(Duration::from_secs(5));
        let mut conn = connect(&address, |opts| {
            opts.set_nodelay(true)?;
            opts.set_keepalive(true)
        })
        .await
        .unwrap();

        let (mut accepted, _) = listener.accept().await.unwrap();

        assert!(conn.configure(|opts| opts.nodelay()).unwrap());
        assert!(conn.configure(|opts| opts.keepalive()).unwrap());
        assert_eq!(conn.peer_addr().unwrap().port(), port);

        conn.send(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then release it so nothing is listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let address = HostAddress::new("127.0.0.1", port).with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = connect(&address, |_| Ok(())).await;

        assert!(matches!(
            result,
            Err(ConnectionError::Refused) | Err(ConnectionError::Timeout)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_configure_failure_is_reported() {
        let address = HostAddress::new("127.0.0.1", 9);
        let result = connect(&address, |_| {
            Err(io::Error::new(io::ErrorKind::InvalidInput, "bad option"))
        })
        .await;

        assert!(matches!(result, Err(ConnectionError::Configure(_))));
    }

    #[tokio::test]
    async fn test_cancelled_scope_aborts_connect() {
        let scope = TaskScope::new();
        scope.cancel();

        let address = HostAddress::new("127.0.0.1", 9).with_timeout(Duration::from_secs(30));
        let result = Connector::new(scope).connect(&address, |_| Ok(())).await;

        assert!(matches!(result, Err(ConnectionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_prefer_v4_resolves_localhost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let address = HostAddress::new("localhost", port)
            .with_ip_preference(IpPreference::PreferV4)
            .with_timeout(Duration::from_secs(5));
        let conn = connect(&address, |_| Ok(())).await.unwrap();

        assert!(conn.peer_addr().unwrap().is_ipv4());
    }
}
