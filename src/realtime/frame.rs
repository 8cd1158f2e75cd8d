//! WebSocket frame codec (RFC 6455 §5.2).
//!
//! The server only ever decodes client frames (which must be masked) and
//! encodes server frames (which must not be).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{WsError, close_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, WsError> {
        match value & 0x0F {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::Protocol(format!("unknown opcode 0x{other:X}"))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One decoded (and unmasked) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// Set on the first frame of a compressed message.
    pub rsv1: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Decodes one client frame from the front of `buf`.
///
/// Returns `Ok(None)` until the whole frame has arrived. A frame declaring a
/// payload larger than `max_payload` is rejected as soon as its header is
/// readable, before any of the payload is buffered. `rsv1` is only legal
/// when a compression extension was negotiated.
pub fn decode(buf: &mut BytesMut, max_payload: usize, allow_rsv1: bool) -> Result<Option<Frame>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (b0, b1) = (buf[0], buf[1]);
    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    if b0 & 0x30 != 0 || (rsv1 && !allow_rsv1) {
        return Err(WsError::Protocol("reserved bits set".into()));
    }
    let opcode = Opcode::from_u8(b0)?;
    if b1 & 0x80 == 0 {
        return Err(WsError::Protocol("client frames must be masked".into()));
    }

    let (length, mut offset) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        short => (u64::from(short), 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(WsError::Protocol("fragmented control frame".into()));
        }
        if length > 125 {
            return Err(WsError::Protocol("control frame payload over 125 bytes".into()));
        }
        if rsv1 {
            return Err(WsError::Protocol("compressed control frame".into()));
        }
    }
    let length = usize::try_from(length).unwrap_or(usize::MAX);
    if length > max_payload {
        return Err(WsError::MessageTooBig {
            size: length,
            limit: max_payload,
        });
    }

    if buf.len() < offset + 4 + length {
        return Ok(None);
    }
    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[offset..offset + 4]);
    offset += 4;

    buf.advance(offset);
    let mut payload = buf.split_to(length);
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Some(Frame {
        fin,
        rsv1,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Appends one unmasked server frame to `dst`.
pub fn encode(opcode: Opcode, fin: bool, rsv1: bool, payload: &[u8], dst: &mut BytesMut) {
    let mut b0 = opcode.to_u8();
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    dst.reserve(payload.len() + 10);
    dst.put_u8(b0);
    match payload.len() {
        len @ 0..=125 => dst.put_u8(len as u8),
        len @ 126..=0xFFFF => {
            dst.put_u8(126);
            dst.put_u16(len as u16);
        }
        len => {
            dst.put_u8(127);
            dst.put_u64(len as u64);
        }
    }
    dst.put_slice(payload);
}

/// Parses a close frame body into its code and reason.
///
/// An empty body means no status code was sent (reported as `None`).
pub fn parse_close_payload(payload: &[u8]) -> Result<(Option<u16>, String), WsError> {
    match payload.len() {
        0 => Ok((None, String::new())),
        1 => Err(WsError::Protocol("close payload of one byte".into())),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code::is_sendable(code) {
                return Err(WsError::Protocol(format!("invalid close code {code}")));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WsError::InvalidPayload("close reason is not UTF-8".into()))?;
            Ok((Some(code), reason.to_owned()))
        }
    }
}

/// Builds a close frame body. The reason is truncated on a character
/// boundary so the body fits in a control frame.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}
