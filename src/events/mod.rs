//! Events exchanged between the connection driver, protocol engines and
//! stream handlers.
//!
//! [`ServerEvent`]s travel between a [`Server`](crate::server::Server) and its
//! protocol engine; [`ProtocolEvent`]s travel between an engine and the stream
//! handlers it owns. Both are closed sum types so every consumer matches them
//! exhaustively.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use crate::http::{Headers, HttpVersion, Method, StatusCode};

/// Connection-wide events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Bytes read from, or to be written to, the socket.
    RawData {
        data: Bytes,
        peer_addr: Option<SocketAddr>,
    },
    /// The connection is closed (read side) or should be closed (write side).
    Closed,
    /// Whether the connection is idle and the idle timer should run.
    Updated { idle: bool },
}

impl ServerEvent {
    pub fn raw(data: impl Into<Bytes>) -> Self {
        Self::RawData {
            data: data.into(),
            peer_addr: None,
        }
    }
}

/// An informational (`1xx`) status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InformationalStatus(StatusCode);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("status {0} is not informational")]
pub struct NotInformational(pub u16);

impl InformationalStatus {
    pub fn status(self) -> StatusCode {
        self.0
    }
}

impl TryFrom<StatusCode> for InformationalStatus {
    type Error = NotInformational;

    fn try_from(status: StatusCode) -> Result<Self, Self::Error> {
        if status.is_informational() {
            Ok(Self(status))
        } else {
            Err(NotInformational(status.as_u16()))
        }
    }
}

/// Per-stream events. HTTP/1.1 always uses stream id `1`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Request {
        stream_id: u32,
        headers: Headers,
        http_version: HttpVersion,
        method: Method,
        raw_path: String,
    },
    Body {
        stream_id: u32,
        data: Bytes,
    },
    EndBody {
        stream_id: u32,
    },
    /// Raw upgraded bytes (WebSocket frames).
    Data {
        stream_id: u32,
        data: Bytes,
    },
    EndData {
        stream_id: u32,
    },
    Response {
        stream_id: u32,
        headers: Headers,
        status_code: StatusCode,
    },
    InformationalResponse {
        stream_id: u32,
        headers: Headers,
        status_code: InformationalStatus,
    },
    Trailers {
        stream_id: u32,
        headers: Headers,
    },
    StreamClosed {
        stream_id: u32,
    },
}

impl ProtocolEvent {
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Request { stream_id, .. }
            | Self::Body { stream_id, .. }
            | Self::EndBody { stream_id }
            | Self::Data { stream_id, .. }
            | Self::EndData { stream_id }
            | Self::Response { stream_id, .. }
            | Self::InformationalResponse { stream_id, .. }
            | Self::Trailers { stream_id, .. }
            | Self::StreamClosed { stream_id } => *stream_id,
        }
    }
}
