use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::TransferError;

/// A receiver address as `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Accepts `ip`, `host`, `host:port`, `ip:port`, `[v6]:port` and bare IPv6.
    /// A missing port falls back to `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, TransferError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransferError::InvalidTarget("empty address".into()));
        }

        if let Ok(addr) = input.parse::<SocketAddr>() {
            return Ok(Self {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        }

        if let Ok(ip) = input.parse::<IpAddr>() {
            return Ok(Self {
                host: ip.to_string(),
                port: default_port,
            });
        }

        if let Some((host, port)) = input.rsplit_once(':') {
            if host.is_empty() || host.contains(':') {
                return Err(TransferError::InvalidTarget(input.to_string()));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| TransferError::InvalidTarget(input.to_string()))?;
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        Ok(Self {
            host: input.to_string(),
            port: default_port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
