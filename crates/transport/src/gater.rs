use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Admission policy consulted at each stage of connection setup.
///
/// Returning `false` aborts the connection. Every check allows by default.
pub trait ConnectionGater: Send + Sync + 'static {
    fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
        true
    }

    fn intercept_addr_dial(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        true
    }

    /// Called before the handshake of an inbound connection.
    fn intercept_accept(&self, _local: &Multiaddr, _remote: &Multiaddr) -> bool {
        true
    }

    /// Called once the remote identity is authenticated.
    fn intercept_secured(
        &self,
        _direction: Direction,
        _peer: &PeerId,
        _local: &Multiaddr,
        _remote: &Multiaddr,
    ) -> bool {
        true
    }
}
