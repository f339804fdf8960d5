use std::io;

use libp2p_identity::{KeyType, PeerId, SigningError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::session::OpenFailureReason;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    AddressFormat(#[from] AddrError),

    #[error("handshake failed")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    ChannelOpen(#[from] ChannelOpenError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("listener is closed")]
    ListenerClosed,

    #[error("unsupported key type: {0:?}")]
    UnsupportedKeyType(KeyType),

    #[error("failed to sign the handshake credential")]
    Signing(#[from] SigningError),

    #[error("packet of {size} bytes exceeds the {max} byte record limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("request {0:?} rejected by remote")]
    RequestRejected(String),

    #[error("connection gated: {0}")]
    Gated(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("websocket error")]
    WebSocket(#[from] tungstenite::Error),
}

/// Malformed or unsupported layered address.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AddrError {
    #[error("invalid multiaddr {0:?}")]
    Parse(String, #[source] multiaddr::Error),

    #[error("missing {expected} layer in {addr}")]
    MissingLayer {
        expected: &'static str,
        addr: String,
    },

    #[error("unsupported layer {layer} in {addr}")]
    UnsupportedLayer { layer: String, addr: String },

    #[error("listening requires an IP address, got {0}")]
    NotAnIp(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("I/O error during handshake")]
    Io(#[from] io::Error),

    #[error("websocket upgrade failed")]
    WebSocket(#[from] tungstenite::Error),

    #[error("remote selected subprotocol {0:?}")]
    Subprotocol(Option<String>),

    #[error("malformed handshake message")]
    Malformed(#[source] io::Error),

    #[error("incompatible banner {0:?}")]
    Banner(String),

    #[error("no common {0} algorithm")]
    NoCommonAlgorithm(&'static str),

    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("remote identity key could not be decoded")]
    InvalidIdentity(#[from] libp2p_identity::DecodingError),

    #[error("remote key type {0:?} is not supported")]
    UnsupportedKeyType(KeyType),

    #[error("remote static key signature is invalid")]
    BadSignature,

    #[error("expected peer {expected}, remote is {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },

    #[error("handshake timed out")]
    Timeout,
}

#[derive(Clone, Debug, Error)]
#[error("channel open rejected ({reason:?}): {description}")]
pub struct ChannelOpenError {
    pub reason: OpenFailureReason,
    pub description: String,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::ConnectionClosed | Error::ListenerClosed => {
                Self::new(io::ErrorKind::NotConnected, err)
            }
            err => Self::other(err),
        }
    }
}
