use borsh::{BorshDeserialize, BorshSerialize};

/// Why a channel open was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
#[borsh(use_discriminant = true)]
#[non_exhaustive]
pub enum OpenFailureReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

/// One decrypted record of the multiplexing protocol.
///
/// `sender` fields carry the id the sender uses for a channel, `recipient`
/// fields the id the receiver assigned to it.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub(crate) enum Packet {
    GlobalRequest {
        name: String,
        want_reply: bool,
        payload: Vec<u8>,
    },
    RequestSuccess {
        payload: Vec<u8>,
    },
    RequestFailure,
    ChannelOpen {
        kind: String,
        sender: u32,
        window: u32,
        max_packet: u32,
        extra: Vec<u8>,
    },
    ChannelOpenConfirm {
        recipient: u32,
        sender: u32,
        window: u32,
        max_packet: u32,
    },
    ChannelOpenFailure {
        recipient: u32,
        reason: OpenFailureReason,
        description: String,
    },
    ChannelWindowAdjust {
        recipient: u32,
        bytes: u32,
    },
    ChannelData {
        recipient: u32,
        data: Vec<u8>,
    },
    ChannelEof {
        recipient: u32,
    },
    ChannelClose {
        recipient: u32,
    },
    ChannelRequest {
        recipient: u32,
        name: String,
        want_reply: bool,
        payload: Vec<u8>,
    },
    ChannelSuccess {
        recipient: u32,
    },
    ChannelFailure {
        recipient: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::PACKET_OVERHEAD;

    #[test]
    fn test_data_packet_overhead() -> eyre::Result<()> {
        let packet = Packet::ChannelData {
            recipient: u32::MAX,
            data: vec![0xab; 1000],
        };

        assert_eq!(borsh::to_vec(&packet)?.len(), 1000 + PACKET_OVERHEAD);
        Ok(())
    }

    #[test]
    fn test_open_failure_reason_wire_values() -> eyre::Result<()> {
        assert_eq!(borsh::to_vec(&OpenFailureReason::UnknownChannelType)?, [3]);
        assert!(borsh::from_slice::<OpenFailureReason>(&[9]).is_err());
        Ok(())
    }

    #[test]
    fn test_unknown_packet_is_rejected() {
        assert!(borsh::from_slice::<Packet>(&[0xff]).is_err());
    }
}
