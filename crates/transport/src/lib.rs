//! Authenticated, encrypted, multiplexed peer-to-peer streams over WebSocket.
//!
//! A [`Transport`] dials or listens on addresses of the form
//! `/ip4/<addr>/tcp/<port>/ws`. Each connection is secured with a Noise XX
//! handshake bound to the peers' identity keys, then carries any number of
//! [`Stream`]s plus connection-scoped control requests such as keepalives.

pub mod addr;
pub mod capability;
pub mod config;
pub mod connection;
pub mod error;
pub mod gater;
pub mod handshake;
pub mod identity;
pub mod listener;
mod session;
pub mod stream;
pub mod transport;
pub mod ws;

pub use capability::{AddressPair, PeerIdentity, StreamAcceptor, StreamOpener};
pub use config::TransportConfig;
pub use connection::{Connection, ConnectionMeta, ConnectionState, KEEPALIVE_REQUEST, TUNNEL_CHANNEL};
pub use error::{ChannelOpenError, Error, Result};
pub use gater::{ConnectionGater, Direction};
pub use handshake::{Algorithms, Role};
pub use identity::PreSharedKey;
pub use listener::Listener;
pub use session::OpenFailureReason;
pub use stream::Stream;
pub use transport::{Transport, TransportBuilder};
pub use ws::{ByteConn, WsConn, SUBPROTOCOL};
