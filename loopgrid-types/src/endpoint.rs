//! Socket endpoint descriptions used in configuration and on the wire

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Transport type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SocketKind {
    #[default]
    Udp,
    Tcp,
    Tls,
}

/// A host/port/type triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(rename = "type", default)]
    pub kind: SocketKind,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, kind: SocketKind) -> Self {
        Endpoint {
            host: host.into(),
            port,
            kind,
        }
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::new(host, port, SocketKind::Udp)
    }

    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Endpoint::new(host, port, SocketKind::Tls)
    }

    /// Resolve to the first matching socket address
    pub fn to_socket_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}:{}", self.host, self.port),
                )
            })
    }

    /// An endpoint is usable once host and port are set
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
