//! Localpipe CLI - Raw byte pipes between sockets
//!
//! Dial TCP endpoints, forward a local port to a remote address, or expose a
//! one-shot Unix socket bridged to stdin/stdout.

mod config;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use config::{ConfigManager, LocalpipeConfig};
use localpipe_connection::{
    copy, Connection, Connector, HostAddress, IpPreference, SocketSettings, COPY_BUFFER_SIZE,
};
use localpipe_control::TaskScope;
use localpipe_relay_unix::{
    listen_on_unix_socket, RelayOutcome, SessionError, TempPathSpec, UnixRelayHandle,
    UnixSocketPath,
};
use localpipe_server_tcp::Acceptor;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Localpipe - Raw byte pipes between sockets
#[derive(Parser, Debug)]
#[command(name = "localpipe")]
#[command(about = "Localpipe - Raw byte pipes between sockets")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.localpipe/config.json)
    #[arg(long, global = true, env = "LOCALPIPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a TCP endpoint and bridge it to stdin/stdout
    #[command(long_about = r#"
Connect to a TCP endpoint and bridge it to stdin/stdout. Closing stdin
half-closes the connection; the command exits once the peer closes.

EXAMPLES:
  # Talk to a local Redis
  echo PING | localpipe connect 127.0.0.1:6379

  # Prefer IPv6 and give up after 2 seconds
  localpipe connect example.com:80 --prefer v6 --timeout-ms 2000

ENVIRONMENT VARIABLES:
  LOCALPIPE_TIMEOUT_MS   Connect timeout in milliseconds
  LOCALPIPE_PREFER       Address family preference (v4, v6, system)
    "#)]
    Connect {
        /// Target address (host:port or [v6]:port)
        target: String,

        /// Connect timeout in milliseconds
        #[arg(long, env = "LOCALPIPE_TIMEOUT_MS")]
        timeout_ms: Option<u64>,

        /// Address family preference
        #[arg(long, value_enum, env = "LOCALPIPE_PREFER")]
        prefer: Option<PreferArg>,

        /// Disable Nagle's algorithm on the outbound socket
        #[arg(long)]
        nodelay: bool,
    },

    /// Accept TCP connections and forward each one to a target address
    #[command(long_about = r#"
Listen on a local address and forward every accepted connection to the
target address, copying bytes in both directions until both sides close.

EXAMPLES:
  # Expose a local PostgreSQL on another port
  localpipe forward --bind 0.0.0.0:5433 --to 127.0.0.1:5432

ENVIRONMENT VARIABLES:
  LOCALPIPE_BIND          Local address to listen on
  LOCALPIPE_TO            Target address to forward to
  LOCALPIPE_QUEUE         Incoming connection queue capacity
    "#)]
    Forward {
        /// Local address to listen on (e.g., 127.0.0.1:8080)
        #[arg(long, env = "LOCALPIPE_BIND")]
        bind: SocketAddr,

        /// Target address to forward to (e.g., 127.0.0.1:80)
        #[arg(long, env = "LOCALPIPE_TO")]
        to: String,

        /// Incoming connection queue capacity
        #[arg(long, env = "LOCALPIPE_QUEUE")]
        queue_capacity: Option<usize>,

        /// Connect timeout in milliseconds
        #[arg(long, env = "LOCALPIPE_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
    },

    /// Expose a one-shot Unix socket bridged to stdin/stdout
    #[command(long_about = r#"
Create a Unix socket, accept exactly one client and bridge it to
stdin/stdout. The socket path is printed to stderr.

EXAMPLES:
  # Fixed path (a stale socket file there is replaced)
  localpipe unix-relay --path /tmp/app.sock

  # Generated path in a custom directory
  localpipe unix-relay --temp-dir /run/user/1000 --prefix app- --suffix .sock
    "#)]
    UnixRelay {
        /// Socket path; a fresh path is generated when omitted
        #[arg(long, env = "LOCALPIPE_SOCKET_PATH")]
        path: Option<PathBuf>,

        /// Directory for the generated path
        #[arg(long, conflicts_with = "path")]
        temp_dir: Option<PathBuf>,

        /// File name prefix for the generated path
        #[arg(long, conflicts_with = "path")]
        prefix: Option<String>,

        /// File name suffix for the generated path
        #[arg(long, conflicts_with = "path")]
        suffix: Option<String>,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
    /// Print the config file location
    Path,
    /// Write a config file holding the default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PreferArg {
    V4,
    V6,
    System,
}

impl From<PreferArg> for IpPreference {
    fn from(value: PreferArg) -> Self {
        match value {
            PreferArg::V4 => IpPreference::PreferV4,
            PreferArg::V6 => IpPreference::PreferV6,
            PreferArg::System => IpPreference::SystemDefault,
        }
    }
}

/// Setup logging with the specified log level
///
/// Logs go to stderr; stdout carries piped data.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// Build the outbound address from the target string and config defaults
fn target_address(
    target: &str,
    config: &LocalpipeConfig,
    timeout_ms: Option<u64>,
    prefer: Option<PreferArg>,
) -> Result<HostAddress> {
    let address: HostAddress = target
        .parse()
        .context(format!("Invalid target address: {}", target))?;

    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.connect_timeout());
    let preference = prefer.map(IpPreference::from).unwrap_or(config.ip_preference);

    Ok(address
        .with_timeout(timeout)
        .with_ip_preference(preference))
}

/// Copy `a` → `b` and `b` → `a` until both directions reach EOF.
///
/// A direction that finishes cleanly half-closes its sink; an error in either
/// direction ends the bridge.
async fn bridge<A, B>(a: A, b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = async {
        let n = copy(&mut a_read, &mut b_write).await?;
        b_write.shutdown().await?;
        Ok::<_, anyhow::Error>(n)
    };
    let backward = async {
        let n = copy(&mut b_read, &mut a_write).await?;
        a_write.shutdown().await?;
        Ok::<_, anyhow::Error>(n)
    };

    let (forward, backward) = tokio::try_join!(forward, backward)?;
    Ok((forward, backward))
}

async fn run_connect(
    config: &LocalpipeConfig,
    target: String,
    timeout_ms: Option<u64>,
    prefer: Option<PreferArg>,
    nodelay: bool,
) -> Result<()> {
    let address = target_address(&target, config, timeout_ms, prefer)?;
    let mut settings = config.socket.clone();
    if nodelay {
        settings.nodelay = Some(true);
    }

    let scope = TaskScope::new();
    let connector = Connector::new(scope.clone());

    let mut connection = tokio::select! {
        result = connector.connect(&address, |opts| settings.apply(opts)) => {
            result.context(format!("Failed to connect to {}", address))?
        }
        _ = tokio::signal::ctrl_c() => {
            scope.cancel();
            info!("Received Ctrl+C, shutting down...");
            return Ok(());
        }
    };

    info!(
        "Connected to {} ({})",
        address,
        connection
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    );

    {
        let (mut read, mut write) = tokio::io::split(&mut connection);
        let mut stdin = stdin_reader();
        let mut stdout = tokio::io::stdout();

        let upstream = async {
            let n = copy(&mut stdin, &mut write).await?;
            debug!("stdin closed after {} bytes, half-closing", n);
            write.shutdown().await?;
            // Keep reading until the peer closes
            std::future::pending::<()>().await;
            Ok::<_, anyhow::Error>(())
        };

        tokio::select! {
            result = upstream => result?,
            result = copy(&mut read, &mut stdout) => {
                let n = result?;
                debug!("Peer closed after {} bytes", n);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    connection.close().await;
    Ok(())
}

async fn run_forward(
    config: &LocalpipeConfig,
    bind: SocketAddr,
    to: String,
    queue_capacity: Option<usize>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let target = target_address(&to, config, timeout_ms, None)?;

    let mut acceptor_config = config.acceptor.clone();
    if let Some(capacity) = queue_capacity {
        acceptor_config.queue_capacity = capacity;
    }

    let scope = TaskScope::new();
    let acceptor = Acceptor::bind(&scope, bind, acceptor_config)
        .context(format!("Failed to bind {}", bind))?;
    let mut incoming = acceptor
        .incoming()
        .context("Incoming queue already taken")?;

    info!("Forwarding {} → {}", acceptor.local_addr(), target);

    let connector = Connector::new(scope.clone());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let inbound = tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            next = incoming.next() => match next {
                Some(Ok(conn)) => conn,
                Some(Err(e)) => {
                    error!("Accept failed: {}", e);
                    break;
                }
                None => break,
            },
        };

        let connector = connector.clone();
        let target = target.clone();
        let settings = config.socket.clone();
        scope.spawn("forward", async move {
            forward_one(inbound, &connector, &target, &settings).await;
        });
    }

    acceptor.close().await;
    scope.shutdown().await;
    info!("Localpipe stopped");
    Ok(())
}

async fn forward_one(
    mut inbound: Connection,
    connector: &Connector,
    target: &HostAddress,
    settings: &SocketSettings,
) {
    let peer = inbound
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let outbound = match connector.connect(target, |opts| settings.apply(opts)).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer_addr = %peer, "Failed to connect to {}: {}", target, e);
            inbound.close().await;
            return;
        }
    };

    debug!(peer_addr = %peer, "Forwarding to {}", target);
    match bridge(inbound, outbound).await {
        Ok((sent, received)) => {
            debug!(peer_addr = %peer, sent, received, "Forwarding finished")
        }
        Err(e) => warn!(peer_addr = %peer, "Forwarding failed: {:#}", e),
    }
}

async fn run_unix_relay(
    config: &LocalpipeConfig,
    path: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    prefix: Option<String>,
    suffix: Option<String>,
) -> Result<()> {
    let socket_path = match path {
        Some(path) => UnixSocketPath::fixed(path),
        None => {
            let defaults = &config.relay;
            let mut spec = TempPathSpec::new(
                prefix.unwrap_or_else(|| defaults.prefix.clone()),
                suffix.unwrap_or_else(|| defaults.suffix.clone()),
            );
            if let Some(dir) = temp_dir.or_else(|| defaults.temp_dir.clone()) {
                spec = spec.in_dir(dir);
            }
            UnixSocketPath::Temporary(spec)
        }
    };

    let scope = TaskScope::new();
    let handle = listen_on_unix_socket(&scope, socket_path).context("Failed to start relay")?;

    eprintln!("{}", handle.relay.socket_path().display());

    tokio::select! {
        result = pump_relay(&scope, handle, stdin_reader(), tokio::io::stdout()) => match result {
            Ok(outcome) => info!(
                upstream = ?outcome.upstream,
                downstream = ?outcome.downstream,
                "Relay finished"
            ),
            Err(e) => warn!("Relay ended: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    scope.shutdown().await;
    Ok(())
}

/// Bridge a relay to `input`/`output` and wait for the session to end.
///
/// Once the client's byte stream ends, `input` is dropped so the relay's
/// rx → client direction sees EOF even if `input` never closes.
async fn pump_relay<I, O>(
    scope: &TaskScope,
    handle: UnixRelayHandle,
    mut input: I,
    mut output: O,
) -> Result<RelayOutcome, SessionError>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin,
{
    let UnixRelayHandle {
        relay,
        mut client_output,
        mut client_input,
    } = handle;

    let input_task = scope.spawn("relay-input", async move {
        if copy(&mut input, &mut client_input).await.is_ok() {
            let _ = client_input.shutdown().await;
        }
    });

    if let Err(e) = copy(&mut client_output, &mut output).await {
        warn!("Relay stream ended with an error: {}", e);
    }
    drop(client_output);
    input_task.abort();

    relay.wait().await
}

/// Stdin as an async reader fed by a dedicated thread.
///
/// The thread is detached so a read blocked on a terminal never holds up
/// runtime shutdown.
fn stdin_reader() -> impl AsyncRead + Send + Unpin + 'static {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);

    std::thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let item = match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });

    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    StreamReader::new(Box::pin(chunks))
}

fn show_config(path: Option<&Path>, config: &LocalpipeConfig) -> Result<()> {
    let location = match path {
        Some(path) => path.to_path_buf(),
        None => ConfigManager::default_path()?,
    };
    debug!("Config loaded from {:?}", location);
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let config = ConfigManager::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Connect {
            target,
            timeout_ms,
            prefer,
            nodelay,
        } => run_connect(&config, target, timeout_ms, prefer, nodelay).await,
        Commands::Forward {
            bind,
            to,
            queue_capacity,
            timeout_ms,
        } => run_forward(&config, bind, to, queue_capacity, timeout_ms).await,
        Commands::UnixRelay {
            path,
            temp_dir,
            prefix,
            suffix,
        } => run_unix_relay(&config, path, temp_dir, prefix, suffix).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => show_config(cli.config.as_deref(), &config),
            ConfigAction::Path => {
                let path = match cli.config {
                    Some(path) => path,
                    None => ConfigManager::default_path()?,
                };
                println!("{}", path.display());
                Ok(())
            }
            ConfigAction::Init { force } => {
                let path = match cli.config {
                    Some(path) => path,
                    None => ConfigManager::default_path()?,
                };
                ConfigManager::init(&path, force)?;
                info!("Wrote default configuration to {}", path.display());
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localpipe_relay_unix::DirectionResult;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_cli_parses_forward() {
        let cli = Cli::try_parse_from([
            "localpipe",
            "forward",
            "--bind",
            "127.0.0.1:8080",
            "--to",
            "example.com:80",
        ])
        .unwrap();

        match cli.command {
            Commands::Forward { bind, to, .. } => {
                assert_eq!(bind.port(), 8080);
                assert_eq!(to, "example.com:80");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unix_relay_path_conflicts_with_prefix() {
        let result = Cli::try_parse_from([
            "localpipe",
            "unix-relay",
            "--path",
            "/tmp/a.sock",
            "--prefix",
            "x-",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let config = LocalpipeConfig {
            connect_timeout_ms: 9000,
            ip_preference: IpPreference::PreferV6,
            ..Default::default()
        };

        let from_config = target_address("localhost:80", &config, None, None).unwrap();
        assert_eq!(from_config.timeout(), Duration::from_millis(9000));
        assert_eq!(from_config.ip_preference(), IpPreference::PreferV6);

        let overridden =
            target_address("localhost:80", &config, Some(100), Some(PreferArg::V4)).unwrap();
        assert_eq!(overridden.timeout(), Duration::from_millis(100));
        assert_eq!(overridden.ip_preference(), IpPreference::PreferV4);
    }

    #[test]
    fn test_invalid_target_is_rejected() {
        let config = LocalpipeConfig::default();
        assert!(target_address("no-port", &config, None, None).is_err());
    }

    #[tokio::test]
    async fn test_bridge_copies_both_ways() {
        let (a, mut a_peer) = tokio::io::duplex(64);
        let (b, mut b_peer) = tokio::io::duplex(64);

        let bridged = tokio::spawn(bridge(a, b));

        a_peer.write_all(b"to b").await.unwrap();
        a_peer.shutdown().await.unwrap();
        b_peer.write_all(b"to a!").await.unwrap();
        b_peer.shutdown().await.unwrap();

        let mut at_b = Vec::new();
        b_peer.read_to_end(&mut at_b).await.unwrap();
        let mut at_a = Vec::new();
        a_peer.read_to_end(&mut at_a).await.unwrap();

        assert_eq!(at_b, b"to b");
        assert_eq!(at_a, b"to a!");
        assert_eq!(bridged.await.unwrap().unwrap(), (4, 5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relay_pump_ends_when_client_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pump.sock");
        let scope = TaskScope::new();
        let handle = listen_on_unix_socket(&scope, UnixSocketPath::fixed(&path)).unwrap();

        // Input that never reaches EOF, like an idle terminal
        let (input, _input_peer) = tokio::io::duplex(64);
        let mut output = Vec::new();

        let client_path = path.clone();
        let client = tokio::spawn(async move {
            let mut client = tokio::net::UnixStream::connect(&client_path).await.unwrap();
            client.write_all(b"bye").await.unwrap();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            pump_relay(&scope, handle, input, &mut output),
        )
        .await
        .expect("relay should end once the client leaves")
        .unwrap();
        client.await.unwrap();

        assert_eq!(output, b"bye");
        assert!(matches!(outcome.upstream, DirectionResult::Completed(3)));
        assert!(!path.exists());

        tokio::time::timeout(Duration::from_secs(5), scope.shutdown())
            .await
            .expect("no relay task should outlive the session");
    }
}
