//! HTTP/2 framing (RFC 9113 §4 and §6).
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+---------------+
//! |R|                 Stream Identifier (31)      |
//! +-+---------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{ErrorCode, H2Error};

/// The client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

/// Initial flow-control window for streams and the connection.
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;
/// Every peer must accept frames of at least this size.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;
const SETTINGS_ENABLE_CONNECT_PROTOCOL: u16 = 0x8;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        /// Payload length including padding; what flow control counts.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<Setting>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Unknown frame types are skipped.
    Unknown {
        frame_type: u8,
        stream_id: u32,
    },
}

/// A stream dependency as carried by HEADERS and PRIORITY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    /// Wire weight; the effective weight is one more.
    pub weight: u8,
}

impl Priority {
    /// Effective weight, `1..=256`.
    pub fn weight(&self) -> u16 {
        u16::from(self.weight) + 1
    }

    fn decode(buf: &mut Bytes) -> Self {
        let raw = buf.get_u32();
        Self {
            exclusive: raw & 0x8000_0000 != 0,
            dependency: raw & 0x7fff_ffff,
            weight: buf.get_u8(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let dependency = if self.exclusive {
            self.dependency | 0x8000_0000
        } else {
            self.dependency
        };
        buf.put_u32(dependency);
        buf.put_u8(self.weight);
    }
}

/// One SETTINGS parameter. Unknown identifiers are dropped while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
    EnableConnectProtocol(bool),
}

impl Setting {
    fn encode(&self, buf: &mut BytesMut) {
        let (id, value) = match *self {
            Self::HeaderTableSize(v) => (SETTINGS_HEADER_TABLE_SIZE, v),
            Self::EnablePush(v) => (SETTINGS_ENABLE_PUSH, u32::from(v)),
            Self::MaxConcurrentStreams(v) => (SETTINGS_MAX_CONCURRENT_STREAMS, v),
            Self::InitialWindowSize(v) => (SETTINGS_INITIAL_WINDOW_SIZE, v),
            Self::MaxFrameSize(v) => (SETTINGS_MAX_FRAME_SIZE, v),
            Self::MaxHeaderListSize(v) => (SETTINGS_MAX_HEADER_LIST_SIZE, v),
            Self::EnableConnectProtocol(v) => (SETTINGS_ENABLE_CONNECT_PROTOCOL, u32::from(v)),
        };
        buf.put_u16(id);
        buf.put_u32(value);
    }
}

/// The values one side of the connection has announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
            enable_connect_protocol: false,
        }
    }
}

impl Settings {
    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::HeaderTableSize(v) => self.header_table_size = v,
            Setting::EnablePush(v) => self.enable_push = v,
            Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
            Setting::InitialWindowSize(v) => self.initial_window_size = v,
            Setting::MaxFrameSize(v) => self.max_frame_size = v,
            Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
            Setting::EnableConnectProtocol(v) => self.enable_connect_protocol = v,
        }
    }
}

/// Decodes a SETTINGS payload: a sequence of 6-byte `(id, value)` pairs.
pub fn decode_settings(mut payload: Bytes) -> Result<Vec<Setting>, H2Error> {
    if payload.len() % 6 != 0 {
        return Err(H2Error::connection(
            ErrorCode::FrameSizeError,
            "SETTINGS length is not a multiple of 6",
        ));
    }
    let mut params = Vec::with_capacity(payload.len() / 6);
    while payload.has_remaining() {
        let id = payload.get_u16();
        let value = payload.get_u32();
        let setting = match id {
            SETTINGS_HEADER_TABLE_SIZE => Setting::HeaderTableSize(value),
            SETTINGS_ENABLE_PUSH => {
                if value > 1 {
                    return Err(H2Error::protocol("ENABLE_PUSH must be 0 or 1"));
                }
                Setting::EnablePush(value == 1)
            }
            SETTINGS_MAX_CONCURRENT_STREAMS => Setting::MaxConcurrentStreams(value),
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(H2Error::connection(
                        ErrorCode::FlowControlError,
                        "INITIAL_WINDOW_SIZE above 2^31-1",
                    ));
                }
                Setting::InitialWindowSize(value)
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=16_777_215).contains(&value) {
                    return Err(H2Error::protocol("MAX_FRAME_SIZE out of range"));
                }
                Setting::MaxFrameSize(value)
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => Setting::MaxHeaderListSize(value),
            SETTINGS_ENABLE_CONNECT_PROTOCOL => {
                if value > 1 {
                    return Err(H2Error::protocol("ENABLE_CONNECT_PROTOCOL must be 0 or 1"));
                }
                Setting::EnableConnectProtocol(value == 1)
            }
            _ => continue,
        };
        params.push(setting);
    }
    Ok(params)
}

fn encode_header(buf: &mut BytesMut, len: usize, frame_type: u8, flags: u8, stream_id: u32) {
    buf.reserve(FRAME_HEADER_LEN + len);
    buf.put_uint(len as u64, 3);
    buf.put_u8(frame_type);
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

impl Frame {
    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                encode_header(buf, payload.len(), FRAME_DATA, flags, *stream_id);
                buf.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags = 0;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                let mut len = block.len();
                if priority.is_some() {
                    flags |= FLAG_PRIORITY;
                    len += 5;
                }
                encode_header(buf, len, FRAME_HEADERS, flags, *stream_id);
                if let Some(priority) = priority {
                    priority.encode(buf);
                }
                buf.extend_from_slice(block);
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                encode_header(buf, 5, FRAME_PRIORITY, 0, *stream_id);
                priority.encode(buf);
            }
            Frame::RstStream { stream_id, code } => {
                encode_header(buf, 4, FRAME_RST_STREAM, 0, *stream_id);
                buf.put_u32(*code as u32);
            }
            Frame::Settings { ack, params } => {
                if *ack {
                    encode_header(buf, 0, FRAME_SETTINGS, FLAG_ACK, 0);
                } else {
                    encode_header(buf, params.len() * 6, FRAME_SETTINGS, 0, 0);
                    for param in params {
                        param.encode(buf);
                    }
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_header(buf, 4 + block.len(), FRAME_PUSH_PROMISE, flags, *stream_id);
                buf.put_u32(promised_stream_id & 0x7fff_ffff);
                buf.extend_from_slice(block);
            }
            Frame::Ping { ack, payload } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                encode_header(buf, 8, FRAME_PING, flags, 0);
                buf.extend_from_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => {
                encode_header(buf, 8 + debug_data.len(), FRAME_GOAWAY, 0, 0);
                buf.put_u32(last_stream_id & 0x7fff_ffff);
                buf.put_u32(*code as u32);
                buf.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                encode_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
                buf.put_u32(increment & 0x7fff_ffff);
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_header(buf, block.len(), FRAME_CONTINUATION, flags, *stream_id);
                buf.extend_from_slice(block);
            }
            Frame::Unknown { .. } => {}
        }
    }
}

/// Removes padding from a PADDED payload.
fn strip_padding(mut payload: Bytes, flags: u8) -> Result<Bytes, H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::protocol("padded frame without pad length"));
    }
    let pad = usize::from(payload.get_u8());
    if pad > payload.len() {
        return Err(H2Error::protocol("padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

fn require_stream(stream_id: u32, name: &str) -> Result<(), H2Error> {
    if stream_id == 0 {
        return Err(H2Error::protocol(format!("{name} on stream 0")));
    }
    Ok(())
}

fn require_connection(stream_id: u32, name: &str) -> Result<(), H2Error> {
    if stream_id != 0 {
        return Err(H2Error::protocol(format!("{name} on stream {stream_id}")));
    }
    Ok(())
}

fn require_len(payload: &Bytes, len: usize, name: &str) -> Result<(), H2Error> {
    if payload.len() != len {
        return Err(H2Error::connection(
            ErrorCode::FrameSizeError,
            format!("{name} payload must be {len} bytes"),
        ));
    }
    Ok(())
}

/// Splits one frame off the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered. Frames longer than
/// `max_frame_size` are a connection error.
pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, H2Error> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = (usize::from(buf[0]) << 16) | (usize::from(buf[1]) << 8) | usize::from(buf[2]);
    if len > max_frame_size as usize {
        return Err(H2Error::connection(
            ErrorCode::FrameSizeError,
            format!("frame of {len} bytes exceeds {max_frame_size}"),
        ));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    let mut payload = buf.split_to(FRAME_HEADER_LEN + len).freeze();
    payload.advance(3);
    let frame_type = payload.get_u8();
    let flags = payload.get_u8();
    let stream_id = payload.get_u32() & 0x7fff_ffff;

    let frame = match frame_type {
        FRAME_DATA => {
            require_stream(stream_id, "DATA")?;
            Frame::Data {
                stream_id,
                flow_len: len as u32,
                payload: strip_padding(payload, flags)?,
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        FRAME_HEADERS => {
            require_stream(stream_id, "HEADERS")?;
            let mut block = strip_padding(payload, flags)?;
            let priority = if flags & FLAG_PRIORITY != 0 {
                if block.len() < 5 {
                    return Err(H2Error::connection(
                        ErrorCode::FrameSizeError,
                        "HEADERS priority block truncated",
                    ));
                }
                Some(Priority::decode(&mut block))
            } else {
                None
            };
            Frame::Headers {
                stream_id,
                block,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FRAME_PRIORITY => {
            require_stream(stream_id, "PRIORITY")?;
            require_len(&payload, 5, "PRIORITY")?;
            Frame::Priority {
                stream_id,
                priority: Priority::decode(&mut payload),
            }
        }
        FRAME_RST_STREAM => {
            require_stream(stream_id, "RST_STREAM")?;
            require_len(&payload, 4, "RST_STREAM")?;
            Frame::RstStream {
                stream_id,
                code: ErrorCode::from_u32(payload.get_u32()),
            }
        }
        FRAME_SETTINGS => {
            require_connection(stream_id, "SETTINGS")?;
            let ack = flags & FLAG_ACK != 0;
            if ack && !payload.is_empty() {
                return Err(H2Error::connection(
                    ErrorCode::FrameSizeError,
                    "SETTINGS ACK with a payload",
                ));
            }
            Frame::Settings {
                ack,
                params: decode_settings(payload)?,
            }
        }
        FRAME_PUSH_PROMISE => {
            require_stream(stream_id, "PUSH_PROMISE")?;
            let mut block = strip_padding(payload, flags)?;
            if block.len() < 4 {
                return Err(H2Error::connection(
                    ErrorCode::FrameSizeError,
                    "PUSH_PROMISE truncated",
                ));
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id: block.get_u32() & 0x7fff_ffff,
                block,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PING => {
            require_connection(stream_id, "PING")?;
            require_len(&payload, 8, "PING")?;
            let mut data = [0; 8];
            payload.copy_to_slice(&mut data);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                payload: data,
            }
        }
        FRAME_GOAWAY => {
            require_connection(stream_id, "GOAWAY")?;
            if payload.len() < 8 {
                return Err(H2Error::connection(ErrorCode::FrameSizeError, "GOAWAY truncated"));
            }
            Frame::GoAway {
                last_stream_id: payload.get_u32() & 0x7fff_ffff,
                code: ErrorCode::from_u32(payload.get_u32()),
                debug_data: payload,
            }
        }
        FRAME_WINDOW_UPDATE => {
            require_len(&payload, 4, "WINDOW_UPDATE")?;
            Frame::WindowUpdate {
                stream_id,
                increment: payload.get_u32() & 0x7fff_ffff,
            }
        }
        FRAME_CONTINUATION => {
            require_stream(stream_id, "CONTINUATION")?;
            Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        frame_type => Frame::Unknown {
            frame_type,
            stream_id,
        },
    };
    Ok(Some(frame))
}
