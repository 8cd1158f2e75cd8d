//! Sans-IO server side of an established WebSocket connection.

use bytes::{Bytes, BytesMut};

use super::deflate::PerMessageDeflate;
use super::frame::{self, Frame, Opcode};
use super::{WsError, close_code};
use crate::app::WsMessage;

/// Close-handshake state (RFC 6455 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Open,
    /// We sent a close frame and wait for the peer's.
    LocalClosing,
    /// The peer sent a close frame that we have not answered yet.
    RemoteClosing,
    Closed,
}

/// Events parsed from client input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// A complete, reassembled and decompressed message.
    Message(WsMessage),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: Option<u16>, reason: String },
}

/// Frames the server can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutbound {
    Message(WsMessage),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct Partial {
    text: bool,
    compressed: bool,
    data: BytesMut,
}

#[derive(Debug)]
pub struct WsConnection {
    buf: BytesMut,
    state: WsState,
    deflate: Option<PerMessageDeflate>,
    max_message_size: usize,
    partial: Option<Partial>,
    failed: bool,
}

impl WsConnection {
    pub fn new(deflate: Option<PerMessageDeflate>, max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: WsState::Open,
            deflate,
            max_message_size,
            partial: None,
            failed: false,
        }
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    pub fn receive_data(&mut self, data: &[u8]) {
        if !self.failed {
            self.buf.extend_from_slice(data);
        }
    }

    /// Parses the next complete event.
    ///
    /// # Errors
    ///
    /// Any [`WsError`] fails the connection: the caller should send a close
    /// frame with [`WsError::close_code`] and drop the stream. Input after a
    /// failure is discarded.
    pub fn next_event(&mut self) -> Result<Option<WsEvent>, WsError> {
        if self.failed || self.state == WsState::Closed {
            self.buf.clear();
            return Ok(None);
        }
        let result = self.read_event();
        if result.is_err() {
            self.failed = true;
            self.partial = None;
            self.buf.clear();
        }
        result
    }

    fn read_event(&mut self) -> Result<Option<WsEvent>, WsError> {
        loop {
            let Some(frame) = frame::decode(&mut self.buf, self.max_message_size, self.deflate.is_some())?
            else {
                return Ok(None);
            };
            if let Some(event) = self.handle_frame(frame)? {
                return Ok(Some(event));
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<WsEvent>, WsError> {
        match frame.opcode {
            Opcode::Ping => Ok(Some(WsEvent::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(WsEvent::Pong(frame.payload))),
            Opcode::Close => {
                let (code, reason) = frame::parse_close_payload(&frame.payload)?;
                self.state = match self.state {
                    WsState::Open => WsState::RemoteClosing,
                    _ => WsState::Closed,
                };
                Ok(Some(WsEvent::Close { code, reason }))
            }
            Opcode::Text | Opcode::Binary => {
                if self.partial.is_some() {
                    return Err(WsError::Protocol("new message before previous finished".into()));
                }
                let mut partial = Partial {
                    text: frame.opcode == Opcode::Text,
                    compressed: frame.rsv1,
                    data: BytesMut::new(),
                };
                self.append(&mut partial, &frame.payload)?;
                if frame.fin {
                    self.finish(partial).map(Some)
                } else {
                    self.partial = Some(partial);
                    Ok(None)
                }
            }
            Opcode::Continuation => {
                if frame.rsv1 {
                    return Err(WsError::Protocol("rsv1 set on continuation frame".into()));
                }
                let Some(mut partial) = self.partial.take() else {
                    return Err(WsError::Protocol("continuation without a message".into()));
                };
                self.append(&mut partial, &frame.payload)?;
                if frame.fin {
                    self.finish(partial).map(Some)
                } else {
                    self.partial = Some(partial);
                    Ok(None)
                }
            }
        }
    }

    fn append(&self, partial: &mut Partial, payload: &[u8]) -> Result<(), WsError> {
        let size = partial.data.len() + payload.len();
        if size > self.max_message_size {
            return Err(WsError::MessageTooBig {
                size,
                limit: self.max_message_size,
            });
        }
        partial.data.extend_from_slice(payload);
        Ok(())
    }

    fn finish(&mut self, partial: Partial) -> Result<WsEvent, WsError> {
        let data = if partial.compressed {
            let deflate = self
                .deflate
                .as_mut()
                .ok_or_else(|| WsError::Protocol("compressed frame without extension".into()))?;
            Bytes::from(deflate.decompress(&partial.data, self.max_message_size)?)
        } else {
            partial.data.freeze()
        };

        let message = if partial.text {
            let text = String::from_utf8(data.to_vec())
                .map_err(|_| WsError::InvalidPayload("text message is not UTF-8".into()))?;
            WsMessage::Text(text)
        } else {
            WsMessage::Bytes(data)
        };
        Ok(WsEvent::Message(message))
    }

    /// Serializes an outbound frame.
    ///
    /// # Errors
    ///
    /// [`WsError::LocalProtocol`] when the close handshake no longer allows
    /// the frame.
    pub fn send(&mut self, event: WsOutbound) -> Result<Bytes, WsError> {
        let mut out = BytesMut::new();
        match event {
            WsOutbound::Message(message) => {
                if self.state != WsState::Open {
                    return Err(WsError::LocalProtocol("message"));
                }
                let (opcode, payload) = match &message {
                    WsMessage::Text(text) => (Opcode::Text, text.as_bytes()),
                    WsMessage::Bytes(bytes) => (Opcode::Binary, &bytes[..]),
                };
                match self.deflate.as_mut() {
                    Some(deflate) => {
                        let compressed = deflate.compress(payload)?;
                        frame::encode(opcode, true, true, &compressed, &mut out);
                    }
                    None => frame::encode(opcode, true, false, payload, &mut out),
                }
            }
            WsOutbound::Ping(payload) | WsOutbound::Pong(payload) if payload.len() > 125 => {
                return Err(WsError::LocalProtocol("control frame over 125 bytes"));
            }
            WsOutbound::Ping(payload) => {
                self.check_control("ping")?;
                frame::encode(Opcode::Ping, true, false, &payload, &mut out);
            }
            WsOutbound::Pong(payload) => {
                self.check_control("pong")?;
                frame::encode(Opcode::Pong, true, false, &payload, &mut out);
            }
            WsOutbound::Close { code, reason } => {
                self.state = match self.state {
                    WsState::Open => WsState::LocalClosing,
                    WsState::RemoteClosing => WsState::Closed,
                    _ => return Err(WsError::LocalProtocol("close")),
                };
                let payload = if close_code::is_sendable(code) {
                    frame::close_payload(code, &reason)
                } else {
                    Vec::new()
                };
                frame::encode(Opcode::Close, true, false, &payload, &mut out);
            }
        }
        Ok(out.freeze())
    }

    fn check_control(&self, kind: &'static str) -> Result<(), WsError> {
        match self.state {
            WsState::Open | WsState::RemoteClosing => Ok(()),
            _ => Err(WsError::LocalProtocol(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::frame::tests::client_frame;

    fn connection(max: usize) -> WsConnection {
        WsConnection::new(None, max)
    }

    #[test]
    fn reassembles_fragments() {
        let mut conn = connection(1024);
        conn.receive_data(&client_frame(0x1, false, b"Hel"));
        assert_eq!(conn.next_event().unwrap(), None);
        // A ping may be interleaved with a fragmented message.
        conn.receive_data(&client_frame(0x9, true, b"p"));
        conn.receive_data(&client_frame(0x0, true, b"lo"));
        assert_eq!(
            conn.next_event().unwrap(),
            Some(WsEvent::Ping(Bytes::from_static(b"p")))
        );
        assert_eq!(
            conn.next_event().unwrap(),
            Some(WsEvent::Message(WsMessage::Text("Hello".into())))
        );
    }

    #[test]
    fn accumulated_size_limit() {
        let mut conn = connection(10);
        conn.receive_data(&client_frame(0x2, false, &[0u8; 6]));
        conn.receive_data(&client_frame(0x0, true, &[0u8; 6]));
        let err = conn.next_event().unwrap_err();
        assert_eq!(err.close_code(), close_code::MESSAGE_TOO_BIG);
        // Later input is ignored.
        conn.receive_data(&client_frame(0x2, true, b"x"));
        assert_eq!(conn.next_event().unwrap(), None);
    }

    #[test]
    fn invalid_utf8_is_1007() {
        let mut conn = connection(1024);
        conn.receive_data(&client_frame(0x1, true, &[0xff, 0xfe]));
        assert_eq!(conn.next_event().unwrap_err().close_code(), 1007);
    }

    #[test]
    fn remote_close_handshake() {
        let mut conn = connection(1024);
        conn.receive_data(&client_frame(0x8, true, &frame::close_payload(1000, "done")));
        assert_eq!(
            conn.next_event().unwrap(),
            Some(WsEvent::Close {
                code: Some(1000),
                reason: "done".into()
            })
        );
        assert_eq!(conn.state(), WsState::RemoteClosing);
        assert!(conn.send(WsOutbound::Message(WsMessage::Text("late".into()))).is_err());
        let reply = conn
            .send(WsOutbound::Close {
                code: 1000,
                reason: String::new(),
            })
            .unwrap();
        assert_eq!(&reply[..], &[0x88, 0x02, 0x03, 0xe8]);
        assert_eq!(conn.state(), WsState::Closed);
    }

    #[test]
    fn local_close_then_remote_reply() {
        let mut conn = connection(1024);
        conn.send(WsOutbound::Close {
            code: 1001,
            reason: String::new(),
        })
        .unwrap();
        assert_eq!(conn.state(), WsState::LocalClosing);
        assert!(conn.send(WsOutbound::Ping(Bytes::new())).is_err());
        conn.receive_data(&client_frame(0x8, true, b""));
        assert!(matches!(
            conn.next_event().unwrap(),
            Some(WsEvent::Close { code: None, .. })
        ));
        assert_eq!(conn.state(), WsState::Closed);
    }

    #[test]
    fn compressed_round_trip_through_connection() {
        let offer = vec!["permessage-deflate".to_owned()];
        let (server_ext, _) = PerMessageDeflate::negotiate(&offer).unwrap();
        let (mut client_ext, _) = PerMessageDeflate::negotiate(&offer).unwrap();
        let mut conn = WsConnection::new(Some(server_ext), 1024);

        let payload = client_ext.compress(b"compressed hello").unwrap();
        let mut raw = client_frame(0x1, true, &payload);
        raw[0] |= 0x40;
        conn.receive_data(&raw);
        assert_eq!(
            conn.next_event().unwrap(),
            Some(WsEvent::Message(WsMessage::Text("compressed hello".into())))
        );

        let out = conn.send(WsOutbound::Message(WsMessage::Text("reply".into()))).unwrap();
        assert_eq!(out[0], 0xC1);
    }

    #[test]
    fn continuation_without_start_is_protocol_error() {
        let mut conn = connection(1024);
        conn.receive_data(&client_frame(0x0, true, b"x"));
        assert_eq!(conn.next_event().unwrap_err().close_code(), 1002);
    }
}
