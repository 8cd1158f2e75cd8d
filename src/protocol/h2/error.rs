//! HTTP/2 error codes and engine errors.

use thiserror::Error;

/// HTTP/2 error codes (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes are treated as `INTERNAL_ERROR`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Errors raised by the HTTP/2 engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum H2Error {
    /// The peer broke the protocol; the connection is over.
    #[error("connection error {code:?}: {reason}")]
    Connection { code: ErrorCode, reason: String },

    /// A send on a stream that is no longer open.
    #[error("stream {0} is closed")]
    StreamClosed(u32),

    /// The header block could not be decoded.
    #[error("header block decoding failed: {0}")]
    Hpack(String),

    /// More data than the flow-control window allows.
    #[error("stream {0} has no send window for {1} bytes")]
    FlowControl(u32, usize),

    /// The peer disabled server push or the parent stream cannot push.
    #[error("server push refused")]
    PushRefused,
}

impl H2Error {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Connection {
            code: ErrorCode::ProtocolError,
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    /// The code carried by the GOAWAY this error ends the connection with.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection { code, .. } => *code,
            Self::Hpack(_) => ErrorCode::CompressionError,
            Self::FlowControl(..) => ErrorCode::FlowControlError,
            Self::StreamClosed(_) => ErrorCode::StreamClosed,
            Self::PushRefused => ErrorCode::RefusedStream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_map_to_internal_error() {
        assert_eq!(ErrorCode::from_u32(0x7), ErrorCode::RefusedStream);
        assert_eq!(ErrorCode::from_u32(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn hpack_failures_are_compression_errors() {
        assert_eq!(H2Error::Hpack("bad index".into()).code(), ErrorCode::CompressionError);
        assert_eq!(H2Error::protocol("x").code(), ErrorCode::ProtocolError);
    }
}
