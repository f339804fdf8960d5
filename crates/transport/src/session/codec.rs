use std::io;
use std::sync::Arc;

use bytes::Bytes;
use snow::StatelessTransportState;

use super::packet::Packet;
use crate::handshake::{RecordReader, RecordWriter, MAX_RECORD_LEN, MAX_RECORD_PLAINTEXT};

/// Decrypts and decodes inbound packets. Nonces count up from zero.
pub(crate) struct PacketReader {
    records: RecordReader,
    noise: Arc<StatelessTransportState>,
    nonce: u64,
    plaintext: Vec<u8>,
}

impl PacketReader {
    pub(crate) fn new(records: RecordReader, noise: Arc<StatelessTransportState>) -> Self {
        Self {
            records,
            noise,
            nonce: 0,
            plaintext: vec![0; MAX_RECORD_LEN],
        }
    }

    pub(crate) async fn next(&mut self) -> io::Result<Option<Packet>> {
        let Some(record) = self.records.next().await? else {
            return Ok(None);
        };

        let n = self
            .noise
            .read_message(self.nonce, &record, &mut self.plaintext)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.nonce += 1;

        borsh::from_slice(&self.plaintext[..n]).map(Some)
    }
}

/// Encodes and encrypts outbound packets.
pub(crate) struct PacketWriter {
    records: RecordWriter,
    noise: Arc<StatelessTransportState>,
    nonce: u64,
    ciphertext: Vec<u8>,
}

impl PacketWriter {
    pub(crate) fn new(records: RecordWriter, noise: Arc<StatelessTransportState>) -> Self {
        Self {
            records,
            noise,
            nonce: 0,
            ciphertext: vec![0; MAX_RECORD_LEN],
        }
    }

    pub(crate) async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        let plaintext = borsh::to_vec(packet)?;
        if plaintext.len() > MAX_RECORD_PLAINTEXT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet of {} bytes does not fit in a record", plaintext.len()),
            ));
        }

        let n = self
            .noise
            .write_message(self.nonce, &plaintext, &mut self.ciphertext)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.nonce += 1;

        self.records
            .send(Bytes::copy_from_slice(&self.ciphertext[..n]))
            .await
    }
}
