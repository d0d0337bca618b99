//! Socket option handling
//!
//! [`SocketOptions`] is a short-lived mutator borrowed from an open socket; it
//! never takes ownership of the descriptor. [`SocketSettings`] is the
//! declarative, serializable form used by configuration files and the CLI.

use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::io;
use std::time::Duration;

/// SO_LINGER behavior on close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linger {
    Off,
    #[serde(rename = "after_ms", with = "duration_ms")]
    After(Duration),
}

impl From<Option<Duration>> for Linger {
    fn from(value: Option<Duration>) -> Self {
        match value {
            Some(d) => Linger::After(d),
            None => Linger::Off,
        }
    }
}

impl From<Linger> for Option<Duration> {
    fn from(value: Linger) -> Self {
        match value {
            Linger::Off => None,
            Linger::After(d) => Some(d),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Option mutator for one open socket
pub struct SocketOptions<'a> {
    sock: SockRef<'a>,
}

impl<'a> SocketOptions<'a> {
    pub fn new(sock: SockRef<'a>) -> Self {
        Self { sock }
    }

    pub fn set_reuse_addr(&self, reuse: bool) -> io::Result<()> {
        self.sock.set_reuse_address(reuse)
    }

    pub fn reuse_addr(&self) -> io::Result<bool> {
        self.sock.reuse_address()
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.sock.set_recv_buffer_size(size)
    }

    /// The kernel may round or double the requested size (Linux doubles it)
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        self.sock.recv_buffer_size()
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.sock.set_send_buffer_size(size)
    }

    pub fn send_buffer_size(&self) -> io::Result<usize> {
        self.sock.send_buffer_size()
    }

    pub fn set_keepalive(&self, keepalive: bool) -> io::Result<()> {
        self.sock.set_keepalive(keepalive)
    }

    pub fn keepalive(&self) -> io::Result<bool> {
        self.sock.keepalive()
    }

    /// TCP only; fails on Unix-domain sockets
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.sock.set_nodelay(nodelay)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.sock.nodelay()
    }

    pub fn set_linger(&self, linger: Linger) -> io::Result<()> {
        self.sock.set_linger(linger.into())
    }

    pub fn linger(&self) -> io::Result<Linger> {
        self.sock.linger().map(Linger::from)
    }
}

/// Declarative socket options; unset fields leave the OS default in place
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reuse_addr: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_buffer_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_buffer_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodelay: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub linger: Option<Linger>,
}

impl SocketSettings {
    pub fn is_empty(&self) -> bool {
        *self == SocketSettings::default()
    }

    /// Apply every set option, stopping at the first failure
    pub fn apply(&self, opts: &SocketOptions<'_>) -> io::Result<()> {
        if let Some(reuse) = self.reuse_addr {
            opts.set_reuse_addr(reuse)?;
        }
        if let Some(size) = self.recv_buffer_size {
            opts.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            opts.set_send_buffer_size(size)?;
        }
        if let Some(keepalive) = self.keepalive {
            opts.set_keepalive(keepalive)?;
        }
        if let Some(nodelay) = self.nodelay {
            opts.set_nodelay(nodelay)?;
        }
        if let Some(linger) = self.linger {
            opts.set_linger(linger)?;
        }
        Ok(())
    }

    /// Overlay `other` on top of `self`; fields set in `other` win
    pub fn merge(&self, other: &SocketSettings) -> SocketSettings {
        SocketSettings {
            reuse_addr: other.reuse_addr.or(self.reuse_addr),
            recv_buffer_size: other.recv_buffer_size.or(self.recv_buffer_size),
            send_buffer_size: other.send_buffer_size.or(self.send_buffer_size),
            keepalive: other.keepalive.or(self.keepalive),
            nodelay: other.nodelay.or(self.nodelay),
            linger: other.linger.or(self.linger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpSocket;

    #[test]
    fn test_settings_json_roundtrip_shape() {
        let settings = SocketSettings {
            nodelay: Some(true),
            linger: Some(Linger::After(Duration::from_millis(1500))),
            ..Default::default()
        };

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "nodelay": true, "linger": { "after_ms": 1500 } })
        );

        let off: SocketSettings = serde_json::from_str(r#"{ "linger": "off" }"#).unwrap();
        assert_eq!(off.linger, Some(Linger::Off));
        assert!(SocketSettings::default().is_empty());
        assert!(!off.is_empty());
    }

    #[test]
    fn test_merge_prefers_override() {
        let base = SocketSettings {
            keepalive: Some(true),
            nodelay: Some(false),
            ..Default::default()
        };
        let overrides = SocketSettings {
            nodelay: Some(true),
            ..Default::default()
        };

        let merged = base.merge(&overrides);
        assert_eq!(merged.keepalive, Some(true));
        assert_eq!(merged.nodelay, Some(true));
        assert_eq!(merged.linger, None);
    }

    #[tokio::test]
    async fn test_apply_is_observable_on_socket() {
        let socket = TcpSocket::new_v4().unwrap();
        let settings = SocketSettings {
            reuse_addr: Some(true),
            recv_buffer_size: Some(64 * 1024),
            send_buffer_size: Some(64 * 1024),
            keepalive: Some(true),
            nodelay: Some(true),
            linger: Some(Linger::After(Duration::from_secs(2))),
        };

        let opts = SocketOptions::new(SockRef::from(&socket));
        settings.apply(&opts).unwrap();

        assert!(opts.reuse_addr().unwrap());
        assert!(opts.keepalive().unwrap());
        assert!(opts.nodelay().unwrap());
        assert!(opts.recv_buffer_size().unwrap() >= 64 * 1024);
        assert!(opts.send_buffer_size().unwrap() >= 64 * 1024);
        assert_eq!(opts.linger().unwrap(), Linger::After(Duration::from_secs(2)));

        opts.set_linger(Linger::Off).unwrap();
        assert_eq!(opts.linger().unwrap(), Linger::Off);
    }
}
