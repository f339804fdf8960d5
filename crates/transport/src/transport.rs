use core::fmt;
use std::sync::Arc;

use libp2p_identity::{Keypair, PeerId};
use multiaddr::Multiaddr;
use tracing::debug;

use crate::addr::{dial_target, is_dialable, Scheme, WS_PROTOCOL_CODE};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{AddrError, Error, HandshakeError, Result};
use crate::gater::{ConnectionGater, Direction};
use crate::handshake::{handshake, Role};
use crate::identity::{Credential, PreSharedKey};
use crate::listener::Listener;
use crate::ws::{self, ByteConn};

/// Entry point: dials and listens for capable connections.
///
/// Immutable once built and cheap to clone. The transport does not track the
/// connections it creates.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    keypair: Keypair,
    credential: Credential,
    psk: Option<PreSharedKey>,
    gater: Option<Arc<dyn ConnectionGater>>,
    config: TransportConfig,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local_peer", &self.local_peer())
            .field("psk", &self.inner.psk)
            .field("gated", &self.inner.gater.is_some())
            .finish_non_exhaustive()
    }
}

#[must_use]
pub struct TransportBuilder {
    keypair: Keypair,
    psk: Option<PreSharedKey>,
    gater: Option<Arc<dyn ConnectionGater>>,
    config: TransportConfig,
}

impl fmt::Debug for TransportBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuilder")
            .field("psk", &self.psk)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransportBuilder {
    pub fn psk(mut self, psk: PreSharedKey) -> Self {
        self.psk = Some(psk);
        self
    }

    pub fn gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
        self.gater = Some(gater);
        self
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and derives the handshake credential.
    pub fn build(self) -> Result<Transport> {
        self.config.validate()?;

        let credential = Credential::new(&self.keypair)?;

        Ok(Transport {
            inner: Arc::new(Inner {
                keypair: self.keypair,
                credential,
                psk: self.psk,
                gater: self.gater,
                config: self.config,
            }),
        })
    }
}

impl Transport {
    pub fn builder(keypair: Keypair) -> TransportBuilder {
        TransportBuilder {
            keypair,
            psk: None,
            gater: None,
            config: TransportConfig::default(),
        }
    }

    /// A transport with default configuration, no pre-shared key and no gater.
    pub fn new(keypair: Keypair) -> Result<Self> {
        Self::builder(keypair).build()
    }

    /// Connects to `addr` and authenticates the remote as `expected_peer`.
    pub async fn dial(&self, addr: &Multiaddr, expected_peer: PeerId) -> Result<Connection> {
        if let Some(gater) = self.gater() {
            if !gater.intercept_peer_dial(&expected_peer) {
                return Err(Error::Gated("peer dial"));
            }
            if !gater.intercept_addr_dial(&expected_peer, addr) {
                return Err(Error::Gated("address dial"));
            }
        }

        let target = dial_target(addr)?;
        if target.scheme == Scheme::Wss {
            return Err(AddrError::UnsupportedLayer {
                layer: Scheme::Wss.as_str().to_owned(),
                addr: addr.to_string(),
            }
            .into());
        }

        debug!(%addr, %expected_peer, "Dialing");

        let conn = ws::connect(&target, &self.inner.config.websocket).await?;
        let connection = self.upgrade(Arc::new(conn), Role::Initiator).await?;

        let actual = connection.remote_peer();
        if actual != expected_peer {
            if let Err(err) = connection.close().await {
                debug!(%err, "Failed to close connection to unexpected peer");
            }
            return Err(HandshakeError::PeerMismatch {
                expected: expected_peer,
                actual,
            }
            .into());
        }

        self.check_secured(&connection, Direction::Outbound).await?;

        Ok(connection)
    }

    /// Binds `addr` and starts accepting WebSocket upgrades on it.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Listener> {
        let socket_addr = dial_target(addr)?.socket_addr()?;

        Listener::bind(self.clone(), socket_addr).await
    }

    /// Runs the handshake for `role` over an already established byte stream.
    ///
    /// The byte stream is closed if the handshake fails.
    pub async fn upgrade(&self, raw: Arc<dyn ByteConn>, role: Role) -> Result<Connection> {
        let inner = &self.inner;

        let secured = handshake(
            Arc::clone(&raw),
            role,
            &inner.credential,
            inner.psk.as_ref(),
            &inner.config.handshake,
        )
        .await;

        match secured {
            Ok(secured) => Ok(Connection::new(self.clone(), raw, secured)),
            Err(err) => {
                debug!(?role, remote_addr=%raw.remote_addr(), %err, "Handshake failed");
                if let Err(err) = raw.close().await {
                    debug!(%err, "Failed to close byte stream after handshake failure");
                }
                Err(err.into())
            }
        }
    }

    /// Gives the gater a say over an authenticated connection, closing it on refusal.
    pub(crate) async fn check_secured(
        &self,
        connection: &Connection,
        direction: Direction,
    ) -> Result<()> {
        let Some(gater) = self.gater() else {
            return Ok(());
        };

        if gater.intercept_secured(
            direction,
            &connection.remote_peer(),
            connection.local_multiaddr(),
            connection.remote_multiaddr(),
        ) {
            return Ok(());
        }

        debug!(remote_peer=%connection.remote_peer(), ?direction, "Secured connection gated");
        if let Err(err) = connection.close().await {
            debug!(%err, "Failed to close gated connection");
        }

        Err(Error::Gated("secured connection"))
    }

    #[must_use]
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        is_dialable(addr)
    }

    /// Multiaddr protocol codes this transport handles.
    #[must_use]
    pub const fn protocols(&self) -> &'static [u32] {
        &[WS_PROTOCOL_CODE]
    }

    #[must_use]
    pub const fn proxy(&self) -> bool {
        false
    }

    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.inner.credential.local_peer()
    }

    #[must_use]
    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub(crate) fn gater(&self) -> Option<&Arc<dyn ConnectionGater>> {
        self.inner.gater.as_ref()
    }
}
