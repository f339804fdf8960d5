#[cfg(test)]
#[path = "tests/config.rs"]
mod tests;

use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::handshake::{MAX_RECORD_PLAINTEXT, PACKET_OVERHEAD};

pub const BANNER_PREFIX: &str = "WSSH-1.0-";

pub const DEFAULT_BANNER: &str = concat!(
    "WSSH-1.0-",
    env!("CARGO_PKG_NAME"),
    "_",
    env!("CARGO_PKG_VERSION")
);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub mux: MuxConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_owned()));

        if !self.handshake.banner.starts_with(BANNER_PREFIX) {
            return invalid("handshake.banner must start with the protocol prefix");
        }
        if self.handshake.banner.len() > 255 {
            return invalid("handshake.banner is longer than 255 bytes");
        }
        if self.handshake.ciphers.is_empty() {
            return invalid("handshake.ciphers must not be empty");
        }
        if self.handshake.hashes.is_empty() {
            return invalid("handshake.hashes must not be empty");
        }
        if self.mux.max_packet == 0 || self.mux.max_packet as usize > MAX_DATA_PAYLOAD {
            return invalid("mux.max_packet must fit in a single record");
        }
        if self.mux.window_size < self.mux.max_packet {
            return invalid("mux.window_size must be at least mux.max_packet");
        }
        if self.mux.stream_queue == 0 || self.mux.offer_queue == 0 || self.mux.request_queue == 0 {
            return invalid("mux queue capacities must be non-zero");
        }
        if self.websocket.incoming_queue == 0 {
            return invalid("websocket.incoming_queue must be non-zero");
        }
        if !self.websocket.path.starts_with('/') {
            return invalid("websocket.path must start with '/'");
        }

        Ok(())
    }
}

/// Largest channel data payload that still fits a single encrypted record.
pub const MAX_DATA_PAYLOAD: usize = MAX_RECORD_PLAINTEXT - PACKET_OVERHEAD;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_banner")]
    pub banner: String,

    /// Allowed AEAD ciphers, most preferred first.
    #[serde(default = "default_ciphers")]
    pub ciphers: Vec<Cipher>,

    /// Allowed hash functions for HMAC-based key derivation, most preferred first.
    #[serde(default = "default_hashes")]
    pub hashes: Vec<Hash>,

    #[serde(default = "default_handshake_timeout")]
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            banner: default_banner(),
            ciphers: default_ciphers(),
            hashes: default_hashes(),
            timeout: default_handshake_timeout(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Cipher {
    ChaChaPoly,
    #[serde(rename = "AESGCM")]
    AesGcm,
}

impl Cipher {
    pub const ALL: &'static [Self] = &[Self::ChaChaPoly, Self::AesGcm];

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|cipher| cipher.as_str() == name)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChaChaPoly => "ChaChaPoly",
            Self::AesGcm => "AESGCM",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Hash {
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "BLAKE2s")]
    Blake2s,
    #[serde(rename = "SHA512")]
    Sha512,
    #[serde(rename = "BLAKE2b")]
    Blake2b,
}

impl Hash {
    pub const ALL: &'static [Self] = &[Self::Sha256, Self::Blake2s, Self::Sha512, Self::Blake2b];

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|hash| hash.as_str() == name)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Blake2s => "BLAKE2s",
            Self::Sha512 => "SHA512",
            Self::Blake2b => "BLAKE2b",
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Receive credit granted to the remote per channel.
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    #[serde(default = "default_max_packet")]
    pub max_packet: u32,

    /// Accepted streams waiting for `accept_stream`.
    #[serde(default = "default_stream_queue")]
    pub stream_queue: usize,

    /// Channel offers waiting for the inbound-channel loop. Offers beyond this are rejected.
    #[serde(default = "default_offer_queue")]
    pub offer_queue: usize,

    #[serde(default = "default_request_queue")]
    pub request_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_packet: default_max_packet(),
            stream_queue: default_stream_queue(),
            offer_queue: default_offer_queue(),
            request_queue: default_request_queue(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_ws_handshake_timeout")]
    pub handshake_timeout: Duration,

    #[serde(default = "default_graceful_close_timeout")]
    pub graceful_close_timeout: Duration,

    /// Upgraded connections waiting for `Listener::accept`.
    #[serde(default = "default_incoming_queue")]
    pub incoming_queue: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            handshake_timeout: default_ws_handshake_timeout(),
            graceful_close_timeout: default_graceful_close_timeout(),
            incoming_queue: default_incoming_queue(),
        }
    }
}

fn default_banner() -> String {
    DEFAULT_BANNER.to_owned()
}

fn default_ciphers() -> Vec<Cipher> {
    vec![Cipher::ChaChaPoly, Cipher::AesGcm]
}

fn default_hashes() -> Vec<Hash> {
    vec![Hash::Sha256, Hash::Blake2s]
}

const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_window_size() -> u32 {
    64 * default_max_packet()
}

const fn default_max_packet() -> u32 {
    1 << 15
}

const fn default_stream_queue() -> usize {
    10
}

const fn default_offer_queue() -> usize {
    16
}

const fn default_request_queue() -> usize {
    16
}

fn default_path() -> String {
    "/".to_owned()
}

const fn default_ws_handshake_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_graceful_close_timeout() -> Duration {
    Duration::from_millis(100)
}

const fn default_incoming_queue() -> usize {
    8
}
