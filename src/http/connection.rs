//! Sans-IO HTTP/1.1 server connection.
//!
//! [`H11Connection`] owns no socket. Received bytes are fed in with
//! [`receive_data`](H11Connection::receive_data), parsed events are pulled out
//! with [`next_event`](H11Connection::next_event), and outbound events are
//! turned into bytes by [`send`](H11Connection::send). Each side of the
//! exchange has its own [`H11State`]; the connection can only be reused once
//! both sides reach [`H11State::Done`].

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::request::{BodyChunk, BodyReader, RequestError, RequestHead};
use super::response::{BodyWriter, FramingViolation, encode_head};
use super::{Headers, HttpVersion, Method, StatusCode};

/// The HTTP/2 "prior knowledge" preface as it looks to an HTTP/1.1 parser.
pub const H2_PREFACE_HEAD: &[u8] = b"PRI * HTTP/2.0\r\n\r\n";

/// Per-side state of an HTTP/1.1 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H11State {
    Idle,
    SendResponse,
    SendBody,
    Done,
    MustClose,
    Closed,
    Error,
    SwitchedProtocol,
}

/// Events produced by [`H11Connection::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum H11Event {
    Request(RequestHeadEvent),
    Data(Bytes),
    EndOfMessage,
    /// Nothing can be parsed until more bytes arrive.
    NeedData,
    /// A complete message was read; parsing resumes after the next cycle.
    Paused,
    ConnectionClosed,
    /// The peer opened with the HTTP/2 connection preface.
    Http2Preface,
    /// Raw bytes after a WebSocket upgrade.
    Passthrough(Bytes),
}

/// The parts of a request head surfaced to the protocol engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeadEvent {
    pub method: Method,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Headers,
}

/// Events accepted by [`H11Connection::send`].
#[derive(Debug, Clone)]
pub enum H11Outbound {
    Informational { status: StatusCode, headers: Headers },
    Response { status: StatusCode, headers: Headers },
    Data(Bytes),
    EndOfMessage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum H11Error {
    /// The peer violated the protocol. `status` is the suggested response code.
    #[error("remote protocol error ({status}): {reason}")]
    Remote { status: u16, reason: String },

    /// We attempted to send something the current state does not allow.
    #[error("local protocol error: {0}")]
    Local(String),
}

impl H11Error {
    fn remote(status: u16, reason: impl Into<String>) -> Self {
        Self::Remote {
            status,
            reason: reason.into(),
        }
    }
}

/// A server-side HTTP/1.1 connection state machine.
#[derive(Debug)]
pub struct H11Connection {
    buf: BytesMut,
    max_incomplete_size: usize,
    their_state: H11State,
    our_state: H11State,
    reader: Option<BodyReader>,
    writer: Option<BodyWriter>,
    request_method: Option<Method>,
    request_version: HttpVersion,
    their_keep_alive: bool,
    our_keep_alive: bool,
    waiting_for_continue: bool,
    passthrough: bool,
    remote_error: Option<H11Error>,
}

impl H11Connection {
    /// Creates a connection that rejects request heads larger than
    /// `max_incomplete_size` bytes with a 431.
    pub fn new(max_incomplete_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_incomplete_size,
            their_state: H11State::Idle,
            our_state: H11State::Idle,
            reader: None,
            writer: None,
            request_method: None,
            request_version: HttpVersion::Http11,
            their_keep_alive: true,
            our_keep_alive: true,
            waiting_for_continue: false,
            passthrough: false,
            remote_error: None,
        }
    }

    pub fn their_state(&self) -> H11State {
        self.their_state
    }

    pub fn our_state(&self) -> H11State {
        self.our_state
    }

    /// `true` while the client sent `Expect: 100-continue` and is still
    /// waiting for either a `100` or the final response.
    pub fn they_are_waiting_for_100_continue(&self) -> bool {
        self.waiting_for_continue
    }

    /// Appends received bytes to the parse buffer.
    pub fn receive_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Takes every received byte not yet consumed by the parser.
    pub fn take_trailing_data(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Stops HTTP parsing; every further byte is surfaced as
    /// [`H11Event::Passthrough`]. Outbound response events keep working so a
    /// rejected upgrade can still be answered over HTTP.
    pub fn switch_to_passthrough(&mut self) {
        self.passthrough = true;
        self.their_state = H11State::SwitchedProtocol;
        self.reader = None;
    }

    /// Parses the next event out of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`H11Error::Remote`] for malformed input. The error is sticky:
    /// every later call returns it again.
    pub fn next_event(&mut self) -> Result<H11Event, H11Error> {
        if let Some(err) = &self.remote_error {
            return Err(err.clone());
        }
        if self.passthrough {
            return Ok(if self.buf.is_empty() {
                H11Event::NeedData
            } else {
                H11Event::Passthrough(self.buf.split().freeze())
            });
        }

        let result = match self.their_state {
            H11State::Idle => self.read_request_head(),
            H11State::SendBody => self.read_body(),
            H11State::Done => Ok(if self.buf.is_empty() {
                H11Event::NeedData
            } else {
                H11Event::Paused
            }),
            H11State::SwitchedProtocol => Ok(H11Event::Paused),
            H11State::MustClose | H11State::Closed => Ok(H11Event::ConnectionClosed),
            H11State::SendResponse | H11State::Error => {
                Err(H11Error::remote(400, "connection in error state"))
            }
        };

        if let Err(err) = &result {
            self.their_state = H11State::Error;
            self.remote_error = Some(err.clone());
        }
        result
    }

    fn read_request_head(&mut self) -> Result<H11Event, H11Error> {
        if self.buf.is_empty() {
            return Ok(H11Event::NeedData);
        }
        let preface_len = self.buf.len().min(H2_PREFACE_HEAD.len());
        if self.buf[..preface_len] == H2_PREFACE_HEAD[..preface_len] {
            if preface_len < H2_PREFACE_HEAD.len() {
                return Ok(H11Event::NeedData);
            }
            let _ = self.buf.split_to(H2_PREFACE_HEAD.len());
            self.their_state = H11State::SwitchedProtocol;
            self.our_state = H11State::SwitchedProtocol;
            return Ok(H11Event::Http2Preface);
        }

        let parsed = RequestHead::parse(&self.buf).map_err(|e| H11Error::remote(400, e.to_string()))?;
        let Some((head, offset)) = parsed else {
            if self.buf.len() > self.max_incomplete_size {
                return Err(H11Error::remote(431, "request head too large"));
            }
            return Ok(H11Event::NeedData);
        };
        if offset > self.max_incomplete_size {
            return Err(H11Error::remote(431, "request head too large"));
        }
        if head.version == HttpVersion::Http11 && head.headers.get_all("host").count() != 1 {
            return Err(H11Error::remote(400, "missing or duplicate Host header"));
        }

        let reader = head.body_reader().map_err(|e| match e {
            RequestError::UnsupportedTransferEncoding => H11Error::remote(501, e.to_string()),
            other => H11Error::remote(400, other.to_string()),
        })?;
        let _ = self.buf.split_to(offset);

        self.their_keep_alive = head.is_keep_alive();
        self.waiting_for_continue = head.expects_continue();
        self.request_method = Some(head.method.clone());
        self.request_version = head.version;
        self.reader = Some(reader);
        self.their_state = H11State::SendBody;
        self.our_state = H11State::SendResponse;

        Ok(H11Event::Request(RequestHeadEvent {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
        }))
    }

    fn read_body(&mut self) -> Result<H11Event, H11Error> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(H11Error::remote(400, "body without request"));
        };
        match reader
            .read(&mut self.buf)
            .map_err(|e| H11Error::remote(400, e.to_string()))?
        {
            BodyChunk::Data(data) => {
                self.waiting_for_continue = false;
                Ok(H11Event::Data(data))
            }
            BodyChunk::End => {
                self.reader = None;
                self.waiting_for_continue = false;
                self.their_state = self.done_state(self.their_keep_alive && self.our_keep_alive);
                if self.our_state == H11State::Done && !self.our_keep_alive {
                    self.our_state = H11State::MustClose;
                }
                Ok(H11Event::EndOfMessage)
            }
            BodyChunk::NeedData => Ok(H11Event::NeedData),
        }
    }

    fn done_state(&self, keep_alive: bool) -> H11State {
        if keep_alive {
            H11State::Done
        } else {
            H11State::MustClose
        }
    }

    /// Serializes an outbound event.
    ///
    /// # Errors
    ///
    /// Returns [`H11Error::Local`] when the event is not valid in the current
    /// state or violates the declared body framing. The local side moves to
    /// [`H11State::Error`].
    pub fn send(&mut self, event: H11Outbound) -> Result<Bytes, H11Error> {
        let result = self.send_inner(event);
        if result.is_err() {
            self.our_state = H11State::Error;
        }
        result
    }

    fn send_inner(&mut self, event: H11Outbound) -> Result<Bytes, H11Error> {
        match event {
            H11Outbound::Informational { status, headers } => {
                if self.our_state != H11State::SendResponse {
                    return Err(local("informational response sent in wrong state"));
                }
                if !status.is_informational() {
                    return Err(local("informational status must be 1xx"));
                }
                self.waiting_for_continue = false;
                if status == StatusCode::SWITCHING_PROTOCOLS {
                    self.our_state = H11State::SwitchedProtocol;
                }
                Ok(encode_head(status, &headers).freeze())
            }
            H11Outbound::Response { status, mut headers } => {
                // A response from `Idle` answers a request that failed to parse.
                if !matches!(self.our_state, H11State::SendResponse | H11State::Idle) {
                    return Err(local("response sent in wrong state"));
                }
                if status.as_u16() < 200 {
                    return Err(local("final response status must be >= 200"));
                }
                self.waiting_for_continue = false;
                let writer = self.prepare_response_headers(status, &mut headers)?;
                self.writer = Some(writer);
                self.our_state = H11State::SendBody;
                Ok(encode_head(status, &headers).freeze())
            }
            H11Outbound::Data(data) => {
                if self.our_state != H11State::SendBody {
                    return Err(local("body data sent in wrong state"));
                }
                let writer = self.writer.as_mut().ok_or_else(|| local("no response writer"))?;
                writer.write(&data).map_err(framing_error)
            }
            H11Outbound::EndOfMessage => {
                if self.our_state != H11State::SendBody {
                    return Err(local("end of message sent in wrong state"));
                }
                let mut writer = self.writer.take().ok_or_else(|| local("no response writer"))?;
                let bytes = writer.finish().map_err(framing_error)?;
                let keep_alive =
                    self.our_keep_alive && writer != BodyWriter::CloseDelimited;
                self.our_keep_alive = keep_alive;
                self.our_state = self.done_state(keep_alive && self.their_keep_alive);
                if self.their_state == H11State::Done && !keep_alive {
                    self.their_state = H11State::MustClose;
                }
                Ok(bytes)
            }
        }
    }

    /// Fixes up framing and `connection` headers for a final response and
    /// returns the body writer matching them.
    fn prepare_response_headers(
        &mut self,
        status: StatusCode,
        headers: &mut Headers,
    ) -> Result<BodyWriter, H11Error> {
        if headers.has_token("connection", "close") {
            self.our_keep_alive = false;
        }

        let bodyless = self.request_method == Some(Method::Head) || matches!(status.0, 204 | 304);
        let mut writer = if let Some(length) = headers.get("content-length") {
            let length = length
                .trim()
                .parse::<u64>()
                .map_err(|_| local("invalid content-length"))?;
            BodyWriter::Length(length)
        } else if headers.has_token("transfer-encoding", "chunked") {
            BodyWriter::Chunked
        } else if bodyless {
            BodyWriter::Length(0)
        } else if self.request_version == HttpVersion::Http11 {
            headers.insert("transfer-encoding", "chunked");
            BodyWriter::Chunked
        } else {
            self.our_keep_alive = false;
            BodyWriter::CloseDelimited
        };
        if bodyless {
            writer = BodyWriter::Length(0);
        }

        if (!self.our_keep_alive || !self.their_keep_alive)
            && !headers.has_token("connection", "close")
        {
            headers.remove("connection");
            headers.insert("connection", "close");
        }
        Ok(writer)
    }

    /// Resets both sides to [`H11State::Idle`] for the next request.
    ///
    /// # Errors
    ///
    /// Returns [`H11Error::Local`] unless both sides are [`H11State::Done`].
    pub fn start_next_cycle(&mut self) -> Result<(), H11Error> {
        if self.our_state != H11State::Done || self.their_state != H11State::Done {
            return Err(local("cannot start next cycle before both sides are done"));
        }
        self.our_state = H11State::Idle;
        self.their_state = H11State::Idle;
        self.reader = None;
        self.writer = None;
        self.request_method = None;
        self.waiting_for_continue = false;
        Ok(())
    }
}

fn local(reason: &str) -> H11Error {
    H11Error::Local(reason.to_owned())
}

fn framing_error(violation: FramingViolation) -> H11Error {
    match violation {
        FramingViolation::TooMuchData => local("too much data for declared Content-Length"),
        FramingViolation::TooLittleData => local("too little data for declared Content-Length"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with(data: &[u8]) -> H11Connection {
        let mut conn = H11Connection::new(16 * 1024);
        conn.receive_data(data);
        conn
    }

    fn response(status: u16, headers: &[(&str, &str)]) -> H11Outbound {
        H11Outbound::Response {
            status: StatusCode(status),
            headers: headers.iter().copied().collect(),
        }
    }

    #[test]
    fn simple_get_cycle() {
        let mut conn = conn_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let H11Event::Request(req) = conn.next_event().unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/");
        assert_eq!(conn.next_event().unwrap(), H11Event::EndOfMessage);
        assert_eq!(conn.next_event().unwrap(), H11Event::NeedData);

        let head = conn.send(response(200, &[("content-length", "2")])).unwrap();
        assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(&conn.send(H11Outbound::Data(Bytes::from_static(b"ok"))).unwrap()[..], b"ok");
        conn.send(H11Outbound::EndOfMessage).unwrap();
        assert_eq!(conn.our_state(), H11State::Done);
        assert_eq!(conn.their_state(), H11State::Done);
        conn.start_next_cycle().unwrap();
        assert_eq!(conn.our_state(), H11State::Idle);
    }

    #[test]
    fn body_events_in_order() {
        let mut conn = conn_with(b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc");
        assert!(matches!(conn.next_event().unwrap(), H11Event::Request(_)));
        assert_eq!(conn.next_event().unwrap(), H11Event::Data(Bytes::from_static(b"abc")));
        assert_eq!(conn.next_event().unwrap(), H11Event::EndOfMessage);
    }

    #[test]
    fn pipelined_request_pauses() {
        let mut conn = conn_with(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(conn.next_event().unwrap(), H11Event::Request(_)));
        assert_eq!(conn.next_event().unwrap(), H11Event::EndOfMessage);
        assert_eq!(conn.next_event().unwrap(), H11Event::Paused);
    }

    #[test]
    fn chunked_response_added_for_http11() {
        let mut conn = conn_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.next_event().unwrap();
        let head = conn.send(response(200, &[])).unwrap();
        assert!(std::str::from_utf8(&head).unwrap().contains("transfer-encoding: chunked\r\n"));
        assert_eq!(&conn.send(H11Outbound::Data(Bytes::from_static(b"hi"))).unwrap()[..], b"2\r\nhi\r\n");
        assert_eq!(&conn.send(H11Outbound::EndOfMessage).unwrap()[..], b"0\r\n\r\n");
    }

    #[test]
    fn http10_is_close_delimited() {
        let mut conn = conn_with(b"GET / HTTP/1.0\r\n\r\n");
        conn.next_event().unwrap();
        conn.next_event().unwrap();
        let head = conn.send(response(200, &[])).unwrap();
        assert!(std::str::from_utf8(&head).unwrap().contains("connection: close\r\n"));
        conn.send(H11Outbound::EndOfMessage).unwrap();
        assert_eq!(conn.our_state(), H11State::MustClose);
        assert!(conn.start_next_cycle().is_err());
    }

    #[test]
    fn connection_close_header_prevents_reuse() {
        let mut conn = conn_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.next_event().unwrap();
        conn.next_event().unwrap();
        conn.send(response(200, &[("content-length", "0"), ("connection", "close")]))
            .unwrap();
        conn.send(H11Outbound::EndOfMessage).unwrap();
        assert_eq!(conn.our_state(), H11State::MustClose);
        assert_eq!(conn.their_state(), H11State::MustClose);
    }

    #[test]
    fn head_response_has_no_body() {
        let mut conn = conn_with(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.next_event().unwrap();
        conn.send(response(200, &[("content-length", "10")])).unwrap();
        assert!(conn.send(H11Outbound::Data(Bytes::from_static(b"x"))).is_err());
    }

    #[test]
    fn expect_continue_tracking() {
        let mut conn = conn_with(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\n",
        );
        conn.next_event().unwrap();
        assert!(conn.they_are_waiting_for_100_continue());
        let bytes = conn
            .send(H11Outbound::Informational {
                status: StatusCode::CONTINUE,
                headers: Headers::new(),
            })
            .unwrap();
        assert_eq!(&bytes[..], b"HTTP/1.1 100 Continue\r\n\r\n");
        assert!(!conn.they_are_waiting_for_100_continue());
        assert_eq!(conn.our_state(), H11State::SendResponse);
    }

    #[test]
    fn oversized_head_is_431() {
        let mut conn = H11Connection::new(32);
        conn.receive_data(b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: aaaaaaaaaaaaaaaaaaaa");
        assert_eq!(
            conn.next_event(),
            Err(H11Error::Remote {
                status: 431,
                reason: "request head too large".into()
            })
        );
        assert_eq!(conn.their_state(), H11State::Error);
        assert!(conn.next_event().is_err());
    }

    #[test]
    fn missing_host_is_400() {
        let mut conn = conn_with(b"GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(
            conn.next_event(),
            Err(H11Error::Remote { status: 400, .. })
        ));
    }

    #[test]
    fn unknown_transfer_coding_is_501() {
        let mut conn = conn_with(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: br\r\n\r\n");
        assert!(matches!(
            conn.next_event(),
            Err(H11Error::Remote { status: 501, .. })
        ));
    }

    #[test]
    fn detects_h2_preface() {
        let mut conn = conn_with(b"PRI * HTTP/2.0\r\n");
        assert_eq!(conn.next_event().unwrap(), H11Event::NeedData);
        conn.receive_data(b"\r\nSM\r\n\r\n");
        assert_eq!(conn.next_event().unwrap(), H11Event::Http2Preface);
        assert_eq!(&conn.take_trailing_data()[..], b"SM\r\n\r\n");
    }

    #[test]
    fn passthrough_after_upgrade() {
        let mut conn = conn_with(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n\x81\x80",
        );
        assert!(matches!(conn.next_event().unwrap(), H11Event::Request(_)));
        conn.switch_to_passthrough();
        assert_eq!(
            conn.next_event().unwrap(),
            H11Event::Passthrough(Bytes::from_static(b"\x81\x80"))
        );
        assert_eq!(conn.next_event().unwrap(), H11Event::NeedData);
        conn.send(H11Outbound::Informational {
            status: StatusCode::SWITCHING_PROTOCOLS,
            headers: Headers::new(),
        })
        .unwrap();
        assert_eq!(conn.our_state(), H11State::SwitchedProtocol);
    }
}
