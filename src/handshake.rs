//! Handshake packet, the first packet every client sends

use crate::codec::{self, PacketReader, HANDSHAKE_PACKET_ID};
use crate::error::{CodecError, ProxyError};

/// State the client asks to switch to after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    /// Server-list query
    Status = 1,
    /// Player login
    Login = 2,
}

impl TryFrom<u32> for NextState {
    type Error = ProxyError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NextState::Status),
            2 => Ok(NextState::Login),
            other => Err(ProxyError::InvalidNextState(other)),
        }
    }
}

/// Parsed handshake payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub server_address: String,
    pub port: u16,
    pub next_state: NextState,
}

impl Handshake {
    /// Parse a handshake payload (the bytes following packet id 0).
    ///
    /// Fields are read strictly in wire order; anything after the next state
    /// is ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, ProxyError> {
        let mut reader = PacketReader::new(payload);
        let protocol_version = reader.read_varint()?;
        let server_address = reader.read_string()?;
        let port = reader.read_u16()?;
        let next_state = NextState::try_from(reader.read_varint()?)?;

        Ok(Self {
            protocol_version,
            server_address,
            port,
            next_state,
        })
    }

    /// Encode as a complete handshake frame
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(self.server_address.len() + 16);
        codec::write_varint(self.protocol_version, &mut payload);
        codec::write_string(&self.server_address, &mut payload);
        payload.extend_from_slice(&self.port.to_be_bytes());
        codec::write_varint(self.next_state as u32, &mut payload);
        codec::encode_frame(HANDSHAKE_PACKET_ID, &payload)
    }
}
