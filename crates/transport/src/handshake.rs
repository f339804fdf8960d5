//! Secure channel establishment.
//!
//! Both sides first exchange a plaintext [`Hello`] naming their banner and
//! algorithm preferences, then run Noise XX with the negotiated cipher and
//! hash. Both hellos and the optional pre-shared key form the Noise prologue,
//! so any tampering with the negotiation fails the handshake. The responder
//! proves its identity in the second message, the initiator in the third.

use core::fmt;
use std::io;
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};
use bytes::{Bytes, BytesMut};
use libp2p_identity::PublicKey;
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, StatelessTransportState};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::debug;

use crate::config::{Cipher, Hash, HandshakeConfig, BANNER_PREFIX};
use crate::error::HandshakeError;
use crate::identity::{verify_remote, Credential, PreSharedKey};
use crate::ws::ByteConn;

/// Largest record body, bounded by the 2-byte length prefix.
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

/// Authentication tag appended by the AEAD cipher.
pub const TAG_LEN: usize = 16;

pub const MAX_RECORD_PLAINTEXT: usize = MAX_RECORD_LEN - TAG_LEN;

/// Variant tag, recipient and payload length of a data packet.
pub const PACKET_OVERHEAD: usize = 1 + 4 + 4;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Algorithms agreed on during the handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Algorithms {
    pub cipher: Cipher,
    pub hash: Hash,
}

impl fmt::Display for Algorithms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Noise_XX_25519_{}_{}", self.cipher, self.hash)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub(crate) struct Hello {
    pub banner: String,
    pub ciphers: Vec<String>,
    pub hashes: Vec<String>,
}

impl Hello {
    fn from_config(config: &HandshakeConfig) -> Self {
        Self {
            banner: config.banner.clone(),
            ciphers: config.ciphers.iter().map(|c| c.as_str().to_owned()).collect(),
            hashes: config.hashes.iter().map(|h| h.as_str().to_owned()).collect(),
        }
    }
}

#[derive(BorshSerialize)]
struct Prologue<'a> {
    initiator: &'a [u8],
    responder: &'a [u8],
    psk: Option<[u8; 32]>,
}

/// First entry of the initiator's list that the responder also allows.
pub(crate) fn negotiate<'a>(initiator: &'a [String], responder: &[String]) -> Option<&'a str> {
    initiator
        .iter()
        .find(|name| responder.contains(name))
        .map(String::as_str)
}

/// Reads length-prefixed records off a [`ByteConn`].
pub(crate) struct RecordReader {
    conn: Arc<dyn ByteConn>,
    codec: LengthDelimitedCodec,
    buf: BytesMut,
    scratch: Box<[u8]>,
}

impl RecordReader {
    pub(crate) fn new(conn: Arc<dyn ByteConn>) -> Self {
        Self {
            conn,
            codec: record_codec(),
            buf: BytesMut::new(),
            scratch: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// `None` at a clean end of stream.
    pub(crate) async fn next(&mut self) -> io::Result<Option<BytesMut>> {
        loop {
            if let Some(record) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(record));
            }

            let n = self.conn.read(&mut self.scratch).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a record",
                ));
            }

            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    async fn expect(&mut self) -> io::Result<BytesMut> {
        self.next().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended during handshake")
        })
    }
}

/// Writes each record with a single call to the underlying [`ByteConn`].
pub(crate) struct RecordWriter {
    conn: Arc<dyn ByteConn>,
    codec: LengthDelimitedCodec,
    buf: BytesMut,
}

impl RecordWriter {
    pub(crate) fn new(conn: Arc<dyn ByteConn>) -> Self {
        Self {
            conn,
            codec: record_codec(),
            buf: BytesMut::new(),
        }
    }

    pub(crate) async fn send(&mut self, record: Bytes) -> io::Result<()> {
        self.codec.encode(record, &mut self.buf)?;
        let frame = self.buf.split();
        self.conn.write_all(&frame).await
    }
}

fn record_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_RECORD_LEN)
        .new_codec()
}

/// A completed handshake, ready to carry multiplexed traffic.
pub(crate) struct Secured {
    pub noise: StatelessTransportState,
    pub reader: RecordReader,
    pub writer: RecordWriter,
    pub remote_key: PublicKey,
    pub algorithms: Algorithms,
    pub remote_banner: String,
}

/// Runs the handshake for `role` over `conn` within `config.timeout`.
pub(crate) async fn handshake(
    conn: Arc<dyn ByteConn>,
    role: Role,
    credential: &Credential,
    psk: Option<&PreSharedKey>,
    config: &HandshakeConfig,
) -> Result<Secured, HandshakeError> {
    conn.set_deadline(Some(Instant::now() + config.timeout)).await;

    let result = run(Arc::clone(&conn), role, credential, psk, config).await;

    conn.set_deadline(None).await;

    result.map_err(|err| match err {
        HandshakeError::Io(err) if err.kind() == io::ErrorKind::TimedOut => HandshakeError::Timeout,
        err => err,
    })
}

async fn run(
    conn: Arc<dyn ByteConn>,
    role: Role,
    credential: &Credential,
    psk: Option<&PreSharedKey>,
    config: &HandshakeConfig,
) -> Result<Secured, HandshakeError> {
    let mut reader = RecordReader::new(Arc::clone(&conn));
    let mut writer = RecordWriter::new(conn);

    let local_hello = borsh::to_vec(&Hello::from_config(config))?;
    writer.send(Bytes::from(local_hello.clone())).await?;

    let remote_hello = reader.expect().await?;
    let remote: Hello = borsh::from_slice(&remote_hello).map_err(HandshakeError::Malformed)?;

    if !remote.banner.starts_with(BANNER_PREFIX) {
        return Err(HandshakeError::Banner(remote.banner));
    }

    let local = Hello::from_config(config);
    let ((initiator, initiator_raw), (responder, responder_raw)) = match role {
        Role::Initiator => ((&local, &local_hello[..]), (&remote, &remote_hello[..])),
        Role::Responder => ((&remote, &remote_hello[..]), (&local, &local_hello[..])),
    };

    let cipher = negotiate(&initiator.ciphers, &responder.ciphers)
        .and_then(Cipher::from_name)
        .ok_or(HandshakeError::NoCommonAlgorithm("cipher"))?;
    let hash = negotiate(&initiator.hashes, &responder.hashes)
        .and_then(Hash::from_name)
        .ok_or(HandshakeError::NoCommonAlgorithm("hash"))?;
    let algorithms = Algorithms { cipher, hash };

    debug!(?role, %algorithms, remote_banner=%remote.banner, "Negotiated handshake algorithms");

    let prologue = borsh::to_vec(&Prologue {
        initiator: initiator_raw,
        responder: responder_raw,
        psk: psk.map(|key| *key.as_bytes()),
    })?;

    let params: NoiseParams = algorithms.to_string().parse()?;
    let builder = Builder::new(params)
        .local_private_key(credential.static_private())
        .prologue(&prologue);

    let mut noise = match role {
        Role::Initiator => builder.build_initiator()?,
        Role::Responder => builder.build_responder()?,
    };

    let mut message = vec![0; MAX_RECORD_LEN];
    let mut payload = vec![0; MAX_RECORD_LEN];

    let remote_key = match role {
        Role::Initiator => {
            let n = noise.write_message(&[], &mut message)?;
            writer.send(Bytes::copy_from_slice(&message[..n])).await?;

            let record = reader.expect().await?;
            let n = noise.read_message(&record, &mut payload)?;
            let remote_key = authenticate(&noise, &payload[..n])?;

            let n = noise.write_message(credential.payload(), &mut message)?;
            writer.send(Bytes::copy_from_slice(&message[..n])).await?;

            remote_key
        }
        Role::Responder => {
            let record = reader.expect().await?;
            let _n = noise.read_message(&record, &mut payload)?;

            let n = noise.write_message(credential.payload(), &mut message)?;
            writer.send(Bytes::copy_from_slice(&message[..n])).await?;

            let record = reader.expect().await?;
            let n = noise.read_message(&record, &mut payload)?;
            authenticate(&noise, &payload[..n])?
        }
    };

    debug!(?role, remote_peer=%remote_key.to_peer_id(), "Handshake complete");

    Ok(Secured {
        noise: noise.into_stateless_transport_mode()?,
        reader,
        writer,
        remote_key,
        algorithms,
        remote_banner: remote.banner,
    })
}

fn authenticate(noise: &HandshakeState, payload: &[u8]) -> Result<PublicKey, HandshakeError> {
    let remote_static = noise.get_remote_static().ok_or_else(|| {
        HandshakeError::Malformed(io::Error::new(
            io::ErrorKind::InvalidData,
            "remote static key missing",
        ))
    })?;

    verify_remote(payload, remote_static)
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use libp2p_identity::Keypair;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
    use tokio_tungstenite::WebSocketStream;

    use super::*;
    use crate::ws::WsConn;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_negotiate_prefers_initiator_order() {
        let initiator = names(&["ChaChaPoly", "AESGCM"]);
        let responder = names(&["AESGCM", "ChaChaPoly"]);

        assert_eq!(negotiate(&initiator, &responder), Some("ChaChaPoly"));
        assert_eq!(negotiate(&responder, &initiator), Some("AESGCM"));
        assert_eq!(negotiate(&initiator, &names(&["AESGCM"])), Some("AESGCM"));
        assert_eq!(negotiate(&initiator, &names(&["Rot13"])), None);
        assert_eq!(negotiate(&[], &initiator), None);
    }

    #[test]
    fn test_algorithms_render_noise_params() {
        let algorithms = Algorithms {
            cipher: Cipher::AesGcm,
            hash: Hash::Blake2s,
        };

        assert_eq!(algorithms.to_string(), "Noise_XX_25519_AESGCM_BLAKE2s");
        assert!(algorithms.to_string().parse::<NoiseParams>().is_ok());
    }

    async fn conn_pair() -> (Arc<dyn ByteConn>, Arc<dyn ByteConn>) {
        let (a, b) = duplex(1 << 20);
        let a = WebSocketStream::from_raw_socket(a, WsRole::Client, None).await;
        let b = WebSocketStream::from_raw_socket(b, WsRole::Server, None).await;
        let addr = "127.0.0.1:1".parse().unwrap();
        let close = Duration::from_millis(50);

        (
            Arc::new(WsConn::new(a, addr, addr, close)),
            Arc::new(WsConn::new(b, addr, addr, close)),
        )
    }

    async fn run_pair(
        initiator: (&HandshakeConfig, Option<&PreSharedKey>),
        responder: (&HandshakeConfig, Option<&PreSharedKey>),
    ) -> (
        Result<Secured, HandshakeError>,
        Result<Secured, HandshakeError>,
        Credential,
        Credential,
    ) {
        let (a, b) = conn_pair().await;
        let alice = Credential::new(&Keypair::generate_ed25519()).unwrap();
        let bob = Credential::new(&Keypair::generate_ecdsa()).unwrap();

        // A failed side closes its end so the other one is not left waiting.
        let side = |conn: Arc<dyn ByteConn>, role, credential, (config, psk)| async move {
            let result = handshake(Arc::clone(&conn), role, credential, psk, config).await;
            if result.is_err() {
                let _closed = conn.close().await;
            }
            result
        };

        let (left, right) = tokio::join!(
            side(a, Role::Initiator, &alice, initiator),
            side(b, Role::Responder, &bob, responder),
        );

        (left, right, alice, bob)
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let config = HandshakeConfig::default();

        let (left, right, alice, bob) = run_pair((&config, None), (&config, None)).await;
        let (left, right) = (left.unwrap(), right.unwrap());

        assert_eq!(left.remote_key.to_peer_id(), bob.local_peer());
        assert_eq!(right.remote_key.to_peer_id(), alice.local_peer());
        assert_eq!(left.algorithms, right.algorithms);
        assert_eq!(left.algorithms.cipher, Cipher::ChaChaPoly);
        assert_eq!(left.algorithms.hash, Hash::Sha256);
        assert_eq!(left.remote_banner, config.banner);
    }

    #[tokio::test]
    async fn test_handshake_uses_initiator_preference() {
        let initiator = HandshakeConfig {
            ciphers: vec![Cipher::AesGcm, Cipher::ChaChaPoly],
            hashes: vec![Hash::Blake2b, Hash::Sha512],
            ..HandshakeConfig::default()
        };
        let responder = HandshakeConfig {
            hashes: vec![Hash::Sha512, Hash::Blake2b],
            ..HandshakeConfig::default()
        };

        let (left, right, ..) = run_pair((&initiator, None), (&responder, None)).await;
        let (left, right) = (left.unwrap(), right.unwrap());

        let expected = Algorithms {
            cipher: Cipher::AesGcm,
            hash: Hash::Blake2b,
        };
        assert_eq!(left.algorithms, expected);
        assert_eq!(right.algorithms, expected);
    }

    #[tokio::test]
    async fn test_handshake_without_common_cipher_fails() {
        let initiator = HandshakeConfig {
            ciphers: vec![Cipher::ChaChaPoly],
            ..HandshakeConfig::default()
        };
        let responder = HandshakeConfig {
            ciphers: vec![Cipher::AesGcm],
            ..HandshakeConfig::default()
        };

        let (left, right, ..) = run_pair((&initiator, None), (&responder, None)).await;

        assert!(matches!(left, Err(HandshakeError::NoCommonAlgorithm("cipher"))));
        assert!(matches!(right, Err(HandshakeError::NoCommonAlgorithm("cipher"))));
    }

    #[tokio::test]
    async fn test_handshake_with_mismatched_psk_fails() {
        let config = HandshakeConfig::default();
        let ours = PreSharedKey::new([7; 32]);
        let theirs = PreSharedKey::new([8; 32]);

        let (left, right, ..) = run_pair((&config, Some(&ours)), (&config, Some(&theirs))).await;
        assert!(left.is_err());
        assert!(right.is_err());

        let (left, right, ..) = run_pair((&config, Some(&ours)), (&config, None)).await;
        assert!(left.is_err());
        assert!(right.is_err());

        let (left, right, ..) = run_pair((&config, Some(&ours)), (&config, Some(&ours))).await;
        assert!(left.is_ok());
        assert!(right.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_rejects_foreign_banner() {
        let config = HandshakeConfig::default();
        let foreign = HandshakeConfig {
            banner: "SSH-2.0-OpenSSH_9.6".to_owned(),
            ..HandshakeConfig::default()
        };

        let (left, _right, ..) = run_pair((&config, None), (&foreign, None)).await;

        assert!(matches!(left, Err(HandshakeError::Banner(banner)) if banner.starts_with("SSH-2.0")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out_on_silent_peer() {
        let (a, _b) = conn_pair().await;
        let credential = Credential::new(&Keypair::generate_ed25519()).unwrap();
        let config = HandshakeConfig {
            timeout: Duration::from_secs(1),
            ..HandshakeConfig::default()
        };

        let result = handshake(a, Role::Initiator, &credential, None, &config).await;

        assert!(matches!(result, Err(HandshakeError::Timeout)));
    }
}
