//! Conversion between layered addresses and concrete WebSocket endpoints.
//!
//! A dialable address has the shape `/ip4|ip6/<addr>/tcp/<port>/ws`. Listeners
//! advertise their bound socket in the same shape. The transport marker
//! `/wssh` may trail the address in its string form; `multiaddr` has a closed
//! protocol table, so the marker is handled by [`parse_layered`] and
//! [`format_layered`] instead of being registered anywhere.

#[cfg(test)]
#[path = "tests/addr.rs"]
mod tests;

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use multiaddr::{Multiaddr, Protocol};

use crate::error::AddrError;

pub const TRANSPORT_MARKER: &str = "wssh";

/// Multiaddr code of the `ws` protocol.
pub const WS_PROTOCOL_CODE: u32 = 0x01dd;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

/// Where the underlying WebSocket connection is opened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DialTarget {
    pub scheme: Scheme,
    pub host: Host,
    pub port: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Host {
    Ip(IpAddr),
    Dns(String),
}

impl DialTarget {
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        let host = match &self.host {
            Host::Ip(IpAddr::V6(ip)) => format!("[{ip}]"),
            Host::Ip(IpAddr::V4(ip)) => ip.to_string(),
            Host::Dns(name) => name.clone(),
        };

        format!("{}://{}:{}{}", self.scheme.as_str(), host, self.port, path)
    }

    /// Socket address to bind when listening.
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrError> {
        match &self.host {
            Host::Ip(ip) => Ok(SocketAddr::new(*ip, self.port)),
            Host::Dns(name) => Err(AddrError::NotAnIp(name.clone())),
        }
    }

    /// `host:port` as accepted by `TcpStream::connect`.
    #[must_use]
    pub fn authority(&self) -> String {
        match &self.host {
            Host::Ip(ip) => SocketAddr::new(*ip, self.port).to_string(),
            Host::Dns(name) => format!("{}:{}", name, self.port),
        }
    }
}

/// Whether `addr` is a fully resolved IP/TCP/WebSocket address.
#[must_use]
pub fn is_dialable(addr: &Multiaddr) -> bool {
    let mut iter = addr.iter();

    matches!(iter.next(), Some(Protocol::Ip4(_) | Protocol::Ip6(_)))
        && matches!(iter.next(), Some(Protocol::Tcp(_)))
        && matches!(iter.next(), Some(Protocol::Ws(_)))
        && iter.next().is_none()
}

/// Encodes a bound or connected socket address, appending the WebSocket layer.
#[must_use]
pub fn to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };

    Multiaddr::empty()
        .with(ip)
        .with(Protocol::Tcp(addr.port()))
        .with(Protocol::Ws(Cow::Borrowed("/")))
}

/// Decodes a layered address into the endpoint of the WebSocket connection.
pub fn dial_target(addr: &Multiaddr) -> Result<DialTarget, AddrError> {
    let missing = |expected| AddrError::MissingLayer {
        expected,
        addr: addr.to_string(),
    };
    let unsupported = |protocol: &Protocol<'_>| AddrError::UnsupportedLayer {
        layer: protocol.to_string(),
        addr: addr.to_string(),
    };

    let mut iter = addr.iter().peekable();

    let host = match iter.next() {
        Some(Protocol::Ip4(ip)) => Host::Ip(ip.into()),
        Some(Protocol::Ip6(ip)) => Host::Ip(ip.into()),
        Some(Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name)) => {
            Host::Dns(name.into_owned())
        }
        Some(other) => return Err(unsupported(&other)),
        None => return Err(missing("host")),
    };

    let port = match iter.next() {
        Some(Protocol::Tcp(port)) => port,
        Some(other) => return Err(unsupported(&other)),
        None => return Err(missing("tcp")),
    };

    let tls = matches!(iter.peek(), Some(Protocol::Tls));
    if tls {
        let _tls = iter.next();
    }

    let scheme = match iter.next() {
        Some(Protocol::Ws(_)) if tls => Scheme::Wss,
        Some(Protocol::Ws(_)) => Scheme::Ws,
        Some(Protocol::Wss(_)) => Scheme::Wss,
        Some(other) => return Err(unsupported(&other)),
        None => return Err(missing("ws")),
    };

    match iter.next() {
        None | Some(Protocol::P2p(_)) => {}
        Some(other) => return Err(unsupported(&other)),
    }

    if let Some(trailing) = iter.next() {
        return Err(unsupported(&trailing));
    }

    Ok(DialTarget { scheme, host, port })
}

/// Parses the string form of a layered address, accepting the transport
/// marker after the WebSocket layer.
pub fn parse_layered(input: &str) -> Result<Multiaddr, AddrError> {
    let marker = format!("/{TRANSPORT_MARKER}");
    let stripped = input.strip_suffix(marker.as_str()).unwrap_or(input);

    let addr: Multiaddr = stripped
        .parse()
        .map_err(|err| AddrError::Parse(input.to_owned(), err))?;

    if stripped.len() != input.len() && !matches!(addr.iter().last(), Some(Protocol::Ws(_))) {
        return Err(AddrError::MissingLayer {
            expected: "ws",
            addr: input.to_owned(),
        });
    }

    Ok(addr)
}

/// Renders `addr` with the transport marker appended.
#[must_use]
pub fn format_layered(addr: &Multiaddr) -> String {
    format!("{addr}/{TRANSPORT_MARKER}")
}
