//! WebSocket protocol primitives (RFC 6455, RFC 7692).
//!
//! Everything in this module is sans-IO. [`frame`] encodes and decodes single
//! frames, [`connection::WsConnection`] reassembles messages and tracks the
//! close handshake, [`handshake`] validates upgrade requests and builds the
//! accept response, and [`deflate`] implements `permessage-deflate`.
//!
//! The stream handler in [`crate::streams`] drives these types with bytes
//! coming from either an upgraded HTTP/1.1 connection or an HTTP/2 extended
//! CONNECT stream.

use thiserror::Error;

pub mod connection;
pub mod deflate;
pub mod frame;
pub mod handshake;

pub use connection::{WsConnection, WsEvent, WsOutbound, WsState};
pub use handshake::{Handshake, HandshakeError};

/// Close status codes used by the server (RFC 6455 §7.4.1).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Returns `true` if `code` may appear in a close frame on the wire.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// Errors raised while processing WebSocket input or output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WsError {
    /// The peer broke the framing rules.
    #[error("websocket protocol error: {0}")]
    Protocol(String),

    /// A text message was not valid UTF-8, or a compressed payload was corrupt.
    #[error("invalid websocket payload: {0}")]
    InvalidPayload(String),

    #[error("websocket message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooBig { size: usize, limit: usize },

    /// We tried to send something after the close handshake started.
    #[error("cannot send {0} in the current connection state")]
    LocalProtocol(&'static str),
}

impl WsError {
    /// The close code to fail the connection with.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) | Self::LocalProtocol(_) => close_code::PROTOCOL_ERROR,
            Self::InvalidPayload(_) => close_code::INVALID_PAYLOAD,
            Self::MessageTooBig { .. } => close_code::MESSAGE_TOO_BIG,
        }
    }
}
