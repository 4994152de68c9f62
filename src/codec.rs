//! Wire codec for the length-prefixed varint framing used by the game protocol
//!
//! A frame on the wire is `varint(len) ++ varint(packet_id) ++ payload`, where
//! `len` covers the packet id and the payload. Strings are a varint byte length
//! followed by UTF-8.

use crate::error::CodecError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum number of bytes a varint may occupy (32-bit values)
pub const MAX_VARINT_LEN: usize = 5;

/// Largest frame body the codec accepts (the largest 3-byte varint)
pub const MAX_FRAME_LEN: usize = 2_097_151;

/// Packet id of the handshake, status request/response and login kick packets
pub const HANDSHAKE_PACKET_ID: u32 = 0x00;

/// Packet id of the status ping/pong packets
pub const PING_PACKET_ID: u32 = 0x01;

/// A single frame read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packet id. For legacy frames this is the declared length.
    pub id: u32,
    /// Bytes following the packet id
    pub payload: Vec<u8>,
    /// Exact bytes consumed from the stream, length prefix included
    pub raw: Vec<u8>,
    /// The stream ended before the declared length was satisfied
    pub legacy: bool,
}

impl Frame {
    /// Returns true if this is a well-formed frame with the given id
    pub fn is(&self, id: u32) -> bool {
        !self.legacy && self.id == id
    }
}

/// Append the minimal varint encoding of `value` to `buf`
pub fn write_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        if value & !0x7F == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
}

/// Encode `value` as a minimal varint
pub fn encode_varint(value: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    write_varint(value, &mut buf);
    buf
}

/// Number of bytes `value` occupies as a varint
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Decode a varint from the start of `data`, returning the value and the bytes used
pub fn decode_varint(data: &[u8]) -> Result<(u32, usize), CodecError> {
    let mut value: u32 = 0;
    for (i, byte) in data.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::MalformedVarint)
}

/// Read a varint from a stream, one byte at a time.
///
/// Returns the decoded value and the number of bytes consumed. End of stream
/// before the terminating byte is reported as `MalformedVarint`, as is a
/// varint that does not terminate within `MAX_VARINT_LEN` bytes.
pub async fn read_varint<R>(reader: &mut R) -> Result<(u32, usize), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(MAX_VARINT_LEN);
    let value = read_varint_raw(reader, &mut raw).await?;
    Ok((value, raw.len()))
}

async fn read_varint_raw<R>(reader: &mut R, raw: &mut Vec<u8>) -> Result<u32, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::MalformedVarint);
            }
            Err(e) => return Err(e.into()),
        };
        raw.push(byte);
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedVarint)
}

/// Read one frame from a stream.
///
/// If the stream ends before the declared number of bytes arrive, the bytes
/// that did arrive are returned as a legacy frame instead of an error. Some
/// clients send a first packet that does not follow the length-prefixed
/// layout, and the caller decides what to do with it.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(64);
    let declared = read_varint_raw(reader, &mut raw).await? as usize;

    if declared == 0 {
        return Err(CodecError::EmptyFrame);
    }
    if declared > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(declared));
    }

    // The buffer grows with the bytes that arrive, never with the declared length
    let prefix_len = raw.len();
    (&mut *reader)
        .take(declared as u64)
        .read_to_end(&mut raw)
        .await?;

    if raw.len() - prefix_len < declared {
        return Ok(Frame {
            id: declared as u32,
            payload: raw[prefix_len..].to_vec(),
            raw,
            legacy: true,
        });
    }

    let (id, id_len) = decode_varint(&raw[prefix_len..])?;
    Ok(Frame {
        id,
        payload: raw[prefix_len + id_len..].to_vec(),
        raw,
        legacy: false,
    })
}

/// Encode a frame: `varint(len) ++ varint(id) ++ payload`
pub fn encode_frame(id: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let body_len = varint_len(id) + payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body_len));
    }

    let mut buf = Vec::with_capacity(varint_len(body_len as u32) + body_len);
    write_varint(body_len as u32, &mut buf);
    write_varint(id, &mut buf);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Append a length-prefixed UTF-8 string to `buf`
pub fn write_string(value: &str, buf: &mut Vec<u8>) {
    write_varint(value.len() as u32, buf);
    buf.extend_from_slice(value.as_bytes());
}

/// Encode a length-prefixed UTF-8 string
pub fn encode_string(value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(varint_len(value.len() as u32) + value.len());
    write_string(value, &mut buf);
    buf
}

/// Decode a length-prefixed string from the start of `data`, returning it and the bytes used
pub fn decode_string(data: &[u8]) -> Result<(String, usize), CodecError> {
    let (len, prefix) = decode_varint(data)?;
    let len = len as usize;
    let available = data.len() - prefix;
    if available < len {
        return Err(CodecError::TruncatedString {
            declared: len,
            available,
        });
    }
    let value = std::str::from_utf8(&data[prefix..prefix + len])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    Ok((value, prefix + len))
}

/// Cursor over a packet payload
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_varint(&mut self) -> Result<u32, CodecError> {
        let (value, used) = decode_varint(self.remaining())?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let (value, used) = decode_string(self.remaining())?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        match self.remaining() {
            [hi, lo, ..] => {
                self.pos += 2;
                Ok(u16::from_be_bytes([*hi, *lo]))
            }
            _ => Err(CodecError::UnexpectedEnd),
        }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
