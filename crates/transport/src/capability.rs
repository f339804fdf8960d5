//! Narrow views of a [`Connection`], for consumers that need only one facet.

use async_trait::async_trait;
use libp2p_identity::{PeerId, PublicKey};
use multiaddr::Multiaddr;

use crate::connection::Connection;
use crate::error::Result;
use crate::stream::Stream;

pub trait PeerIdentity {
    fn local_peer(&self) -> PeerId;

    fn remote_peer(&self) -> PeerId;

    fn remote_public_key(&self) -> &PublicKey;
}

pub trait AddressPair {
    fn local_multiaddr(&self) -> &Multiaddr;

    fn remote_multiaddr(&self) -> &Multiaddr;
}

#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_stream(&self) -> Result<Stream>;
}

#[async_trait]
pub trait StreamAcceptor: Send + Sync {
    async fn accept_stream(&self) -> Result<Stream>;
}

impl PeerIdentity for Connection {
    fn local_peer(&self) -> PeerId {
        Self::local_peer(self)
    }

    fn remote_peer(&self) -> PeerId {
        Self::remote_peer(self)
    }

    fn remote_public_key(&self) -> &PublicKey {
        Self::remote_public_key(self)
    }
}

impl AddressPair for Connection {
    fn local_multiaddr(&self) -> &Multiaddr {
        Self::local_multiaddr(self)
    }

    fn remote_multiaddr(&self) -> &Multiaddr {
        Self::remote_multiaddr(self)
    }
}

#[async_trait]
impl StreamOpener for Connection {
    async fn open_stream(&self) -> Result<Stream> {
        Self::open_stream(self).await
    }
}

#[async_trait]
impl StreamAcceptor for Connection {
    async fn accept_stream(&self) -> Result<Stream> {
        Self::accept_stream(self).await
    }
}
