use core::fmt;
use core::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use libp2p_identity::{KeyType, Keypair, PeerId, PublicKey};
use snow::params::NoiseParams;
use snow::Builder;

use crate::error::{Error, HandshakeError};

/// Domain separator for the signature that binds a Noise static key to an identity key.
pub const STATIC_KEY_DOMAIN: &[u8] = b"wssh-static-key:";

const STATIC_KEY_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Whether identities of this key type can authenticate a connection.
#[must_use]
pub const fn is_supported(key_type: &KeyType) -> bool {
    matches!(key_type, KeyType::Ed25519 | KeyType::Ecdsa)
}

/// Per-transport handshake credential: an X25519 static key and the identity
/// signature that vouches for it.
pub struct Credential {
    local_peer: PeerId,
    static_private: Vec<u8>,
    static_public: Vec<u8>,
    payload: Vec<u8>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct IdentityPayload {
    /// Protobuf encoding of the identity public key.
    key: Vec<u8>,
    signature: Vec<u8>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("local_peer", &self.local_peer)
            .field("static_public", &hex::encode(&self.static_public))
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn new(keypair: &Keypair) -> Result<Self, Error> {
        let key_type = keypair.key_type();
        if !is_supported(&key_type) {
            return Err(Error::UnsupportedKeyType(key_type));
        }

        let params: NoiseParams = STATIC_KEY_PARAMS.parse().map_err(HandshakeError::from)?;
        let static_keys = Builder::new(params)
            .generate_keypair()
            .map_err(HandshakeError::from)?;

        let signature = keypair.sign(&signed_message(&static_keys.public))?;

        let payload = borsh::to_vec(&IdentityPayload {
            key: keypair.public().encode_protobuf(),
            signature,
        })?;

        Ok(Self {
            local_peer: keypair.public().to_peer_id(),
            static_private: static_keys.private,
            static_public: static_keys.public,
            payload,
        })
    }

    #[must_use]
    pub const fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    #[must_use]
    pub fn static_public(&self) -> &[u8] {
        &self.static_public
    }

    pub(crate) fn static_private(&self) -> &[u8] {
        &self.static_private
    }

    /// Handshake payload announcing this identity.
    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Checks the remote handshake payload against the Noise static key the
/// remote actually proved possession of.
pub(crate) fn verify_remote(
    payload: &[u8],
    remote_static: &[u8],
) -> Result<PublicKey, HandshakeError> {
    let payload: IdentityPayload = borsh::from_slice(payload).map_err(HandshakeError::Malformed)?;

    let key = PublicKey::try_decode_protobuf(&payload.key)?;

    let key_type = key.key_type();
    if !is_supported(&key_type) {
        return Err(HandshakeError::UnsupportedKeyType(key_type));
    }

    if !key.verify(&signed_message(remote_static), &payload.signature) {
        return Err(HandshakeError::BadSignature);
    }

    Ok(key)
}

fn signed_message(static_public: &[u8]) -> Vec<u8> {
    [STATIC_KEY_DOMAIN, static_public].concat()
}

/// Secret shared by all members of a private network.
///
/// Peers holding different keys fail the handshake.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PreSharedKey([u8; 32]);

impl PreSharedKey {
    #[must_use]
    pub const fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PreSharedKey(<redacted>)")
    }
}

impl FromStr for PreSharedKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut key = [0; 32];
        hex::decode_to_slice(s.trim(), &mut key)?;
        Ok(Self(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_rejects_unsupported_key_types() {
        let secp256k1 = Keypair::generate_secp256k1();

        assert!(matches!(
            Credential::new(&secp256k1),
            Err(Error::UnsupportedKeyType(KeyType::Secp256k1))
        ));
    }

    #[test]
    fn test_payload_verifies_against_its_own_static_key() -> eyre::Result<()> {
        for keypair in [Keypair::generate_ed25519(), Keypair::generate_ecdsa()] {
            let credential = Credential::new(&keypair)?;

            let key = verify_remote(credential.payload(), credential.static_public())?;
            assert_eq!(key.to_peer_id(), credential.local_peer());
        }

        Ok(())
    }

    #[test]
    fn test_payload_does_not_verify_against_another_static_key() -> eyre::Result<()> {
        let keypair = Keypair::generate_ed25519();
        let ours = Credential::new(&keypair)?;
        let theirs = Credential::new(&keypair)?;

        assert!(matches!(
            verify_remote(ours.payload(), theirs.static_public()),
            Err(HandshakeError::BadSignature)
        ));
        assert!(matches!(
            verify_remote(b"garbage", ours.static_public()),
            Err(HandshakeError::Malformed(_))
        ));

        Ok(())
    }

    #[test]
    fn test_supported_key_types() {
        assert!(is_supported(&KeyType::Ed25519));
        assert!(is_supported(&KeyType::Ecdsa));
        assert!(!is_supported(&KeyType::Secp256k1));
        assert!(!is_supported(&KeyType::RSA));
    }

    #[test]
    fn test_pre_shared_key_from_hex() {
        let hex_key = "00".repeat(31) + "ff";
        let key: PreSharedKey = hex_key.parse().unwrap();

        assert_eq!(key.as_bytes()[31], 0xff);
        assert_eq!(format!("{key:?}"), "PreSharedKey(<redacted>)");

        assert!("abcd".parse::<PreSharedKey>().is_err());
        assert!("zz".repeat(32).parse::<PreSharedKey>().is_err());
    }
}
