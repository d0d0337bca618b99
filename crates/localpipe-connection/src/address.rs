//! Outbound target addresses

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Connect timeout used when none is given
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Address family preference for hostname resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpPreference {
    PreferV4,
    PreferV6,
    #[default]
    SystemDefault,
}

impl IpPreference {
    /// Reorder resolved addresses so the preferred family comes first.
    ///
    /// The relative order inside each family is kept.
    pub fn order(self, mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
        match self {
            IpPreference::PreferV4 => addrs.sort_by_key(|a| !a.is_ipv4()),
            IpPreference::PreferV6 => addrs.sort_by_key(|a| !a.is_ipv6()),
            IpPreference::SystemDefault => {}
        }
        addrs
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Missing port in address: {0}")]
    MissingPort(String),

    #[error("Invalid port in address: {0}")]
    InvalidPort(String),

    #[error("Missing host in address: {0}")]
    MissingHost(String),
}

/// An unresolved outbound target plus its connect policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    hostname: String,
    port: u16,
    ip_preference: IpPreference,
    timeout: Duration,
}

impl HostAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ip_preference: IpPreference::default(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_ip_preference(mut self, ip_preference: IpPreference) -> Self {
        self.ip_preference = ip_preference;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip_preference(&self) -> IpPreference {
        self.ip_preference
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

impl FromStr for HostAddress {
    type Err = AddressParseError;

    /// Parses `host:port` or `[v6-literal]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?
        };

        if host.is_empty() {
            return Err(AddressParseError::MissingHost(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;

        Ok(HostAddress::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let addr: HostAddress = "example.com:8080".parse().unwrap();
        assert_eq!(addr.hostname(), "example.com");
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.ip_preference(), IpPreference::SystemDefault);
        assert_eq!(addr.timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let addr: HostAddress = "[::1]:5432".parse().unwrap();
        assert_eq!(addr.hostname(), "::1");
        assert_eq!(addr.port(), 5432);
        assert_eq!(addr.to_string(), "[::1]:5432");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "localhost".parse::<HostAddress>(),
            Err(AddressParseError::MissingPort("localhost".to_string()))
        );
        assert_eq!(
            "localhost:http".parse::<HostAddress>(),
            Err(AddressParseError::InvalidPort("localhost:http".to_string()))
        );
        assert_eq!(
            ":80".parse::<HostAddress>(),
            Err(AddressParseError::MissingHost(":80".to_string()))
        );
    }

    #[test]
    fn test_builder() {
        let addr = HostAddress::new("127.0.0.1", 22)
            .with_ip_preference(IpPreference::PreferV6)
            .with_timeout(Duration::from_millis(250));
        assert_eq!(addr.ip_preference(), IpPreference::PreferV6);
        assert_eq!(addr.timeout(), Duration::from_millis(250));
        assert_eq!(addr.to_string(), "127.0.0.1:22");
    }

    #[test]
    fn test_preference_ordering() {
        let v4: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[fe80::1]:80".parse().unwrap();
        let v4b: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let addrs = vec![v6, v4, v4b];

        assert_eq!(IpPreference::PreferV4.order(addrs.clone()), vec![v4, v4b, v6]);
        assert_eq!(IpPreference::PreferV6.order(addrs.clone()), vec![v6, v4, v4b]);
        assert_eq!(IpPreference::SystemDefault.order(addrs.clone()), addrs);
    }
}
