//! A sans-IO HTTP/2 server connection.
//!
//! [`H2Connection`] consumes raw bytes with [`receive_data`] and reports what
//! the peer did as [`H2Event`]s. Everything the server wants to say is queued
//! as frames and collected with [`data_to_send`]. Nothing here touches a
//! socket.
//!
//! [`receive_data`]: H2Connection::receive_data
//! [`data_to_send`]: H2Connection::data_to_send

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::error::{ErrorCode, H2Error};
use super::frame::{self, Frame, PREFACE, Priority, Setting, Settings, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::config::Config;
use crate::http::Headers;

/// Something the peer did.
#[derive(Debug, Clone, PartialEq)]
pub enum H2Event {
    RequestReceived {
        stream_id: u32,
        headers: Headers,
    },
    DataReceived {
        stream_id: u32,
        data: Bytes,
        /// Bytes to hand back with `acknowledge_received_data`.
        flow_controlled_length: u32,
    },
    StreamEnded {
        stream_id: u32,
    },
    /// The peer reset the stream, or the server did because the peer broke
    /// a per-stream rule.
    StreamReset {
        stream_id: u32,
        code: ErrorCode,
    },
    /// Stream 0 means the connection window.
    WindowUpdated {
        stream_id: u32,
    },
    PriorityUpdated {
        stream_id: u32,
        depends_on: u32,
        weight: u16,
        exclusive: bool,
    },
    RemoteSettingsChanged {
        initial_window_size_changed: bool,
    },
    ConnectionTerminated {
        code: ErrorCode,
        last_stream_id: u32,
    },
}

/// Flow-control window. May go negative after a SETTINGS change.
#[derive(Debug, Clone, Copy)]
struct Window(i64);

impl Window {
    fn new(size: u32) -> Self {
        Self(i64::from(size))
    }

    fn consume(&mut self, amount: u32) -> bool {
        let next = self.0 - i64::from(amount);
        if next < 0 {
            return false;
        }
        self.0 = next;
        true
    }

    fn increase(&mut self, amount: i64) -> bool {
        let next = self.0 + amount;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return false;
        }
        self.0 = next;
        true
    }

    fn available(&self) -> u32 {
        self.0.clamp(0, i64::from(MAX_WINDOW_SIZE)) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    /// Promised by PUSH_PROMISE; only the server sends on it.
    ReservedLocal,
}

#[derive(Debug)]
struct StreamEntry {
    phase: Phase,
    send: Window,
    recv: Window,
}

impl StreamEntry {
    fn remote_open(&self) -> bool {
        matches!(self.phase, Phase::Open | Phase::HalfClosedLocal)
    }

    fn local_open(&self) -> bool {
        matches!(self.phase, Phase::Open | Phase::HalfClosedRemote | Phase::ReservedLocal)
    }
}

/// A header block split over HEADERS and CONTINUATION frames.
#[derive(Debug)]
struct PendingHeaders {
    stream_id: u32,
    end_stream: bool,
    priority: Option<Priority>,
    block: BytesMut,
}

pub struct H2Connection {
    local: Settings,
    remote: Settings,
    decoder: loona_hpack::Decoder<'static>,
    encoder: loona_hpack::Encoder<'static>,
    inbound: BytesMut,
    outbound: BytesMut,
    preface_received: bool,
    settings_received: bool,
    streams: HashMap<u32, StreamEntry>,
    continuation: Option<PendingHeaders>,
    send_window: Window,
    recv_window: Window,
    highest_remote_stream: u32,
    next_push_stream: u32,
    goaway_sent: bool,
    failed: bool,
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connection")
            .field("streams", &self.streams.len())
            .field("highest_remote_stream", &self.highest_remote_stream)
            .field("goaway_sent", &self.goaway_sent)
            .finish_non_exhaustive()
    }
}

impl H2Connection {
    pub fn new(config: &Config) -> Self {
        let local = Settings {
            enable_push: false,
            max_concurrent_streams: Some(config.h2_max_concurrent_streams),
            max_frame_size: config.h2_max_inbound_frame_size,
            max_header_list_size: Some(config.h2_max_header_list_size),
            enable_connect_protocol: true,
            ..Settings::default()
        };
        let mut decoder = loona_hpack::Decoder::new();
        decoder.set_max_allowed_table_size(local.header_table_size as usize);
        Self {
            local,
            remote: Settings::default(),
            decoder,
            encoder: loona_hpack::Encoder::new(),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            preface_received: false,
            settings_received: false,
            streams: HashMap::new(),
            continuation: None,
            send_window: Window::new(DEFAULT_WINDOW_SIZE),
            recv_window: Window::new(DEFAULT_WINDOW_SIZE),
            highest_remote_stream: 0,
            next_push_stream: 2,
            goaway_sent: false,
            failed: false,
        }
    }

    /// Queues the server's SETTINGS.
    pub fn initiate_connection(&mut self) {
        let params = vec![
            Setting::MaxConcurrentStreams(self.local.max_concurrent_streams.unwrap_or(u32::MAX)),
            Setting::InitialWindowSize(self.local.initial_window_size),
            Setting::MaxFrameSize(self.local.max_frame_size),
            Setting::MaxHeaderListSize(self.local.max_header_list_size.unwrap_or(u32::MAX)),
            Setting::EnableConnectProtocol(true),
        ];
        self.queue(Frame::Settings { ack: false, params });
    }

    /// Starts after `Upgrade: h2c`: applies the client's `HTTP2-Settings`,
    /// queues the server SETTINGS and opens stream 1 half-closed.
    ///
    /// # Errors
    ///
    /// A connection error when the settings value does not decode. The
    /// connection is started with default peer settings regardless.
    pub fn initiate_upgrade_connection(&mut self, settings: &str) -> Result<(), H2Error> {
        let params = URL_SAFE_NO_PAD
            .decode(settings.trim().trim_end_matches('='))
            .map_err(|e| H2Error::protocol(format!("invalid HTTP2-Settings: {e}")))
            .and_then(|decoded| frame::decode_settings(Bytes::from(decoded)));
        self.initiate_connection();
        self.open_upgraded_stream();
        for setting in params? {
            self.apply_remote(setting)?;
        }
        Ok(())
    }

    fn open_upgraded_stream(&mut self) {
        self.streams.insert(
            1,
            StreamEntry {
                phase: Phase::HalfClosedRemote,
                send: Window::new(self.remote.initial_window_size),
                recv: Window::new(self.local.initial_window_size),
            },
        );
        self.highest_remote_stream = 1;
    }

    /// Feeds bytes from the peer.
    ///
    /// # Errors
    ///
    /// A connection error. GOAWAY has already been queued and the connection
    /// ignores any further input.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<H2Event>, H2Error> {
        if self.failed {
            return Ok(Vec::new());
        }
        self.inbound.extend_from_slice(data);
        let mut events = Vec::new();
        match self.process(&mut events) {
            Ok(()) => Ok(events),
            Err(err) => {
                debug!(error = %err, "http/2 connection error");
                self.failed = true;
                self.send_goaway(err.code(), err.to_string());
                Err(err)
            }
        }
    }

    /// Frames queued for the peer since the last call.
    pub fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Largest DATA payload the peer accepts.
    pub fn max_outbound_frame_size(&self) -> u32 {
        self.remote.max_frame_size
    }

    /// Bytes that may be sent on `stream_id` right now.
    ///
    /// # Errors
    ///
    /// [`H2Error::StreamClosed`] when the stream cannot send.
    pub fn local_flow_control_window(&self, stream_id: u32) -> Result<u32, H2Error> {
        let stream = self.sendable(stream_id)?;
        Ok(stream.send.available().min(self.send_window.available()))
    }

    /// Queues a HEADERS block. Trailers are headers with `end_stream`.
    ///
    /// # Errors
    ///
    /// [`H2Error::StreamClosed`] when the stream cannot send.
    pub fn send_headers(&mut self, stream_id: u32, headers: &Headers, end_stream: bool) -> Result<(), H2Error> {
        self.sendable(stream_id)?;
        let block = self.encode_headers(headers);
        let mut fragments = self.fragments(block);
        let first = fragments.remove(0);
        self.queue(Frame::Headers {
            stream_id,
            block: first,
            end_stream,
            end_headers: fragments.is_empty(),
            priority: None,
        });
        self.queue_continuations(stream_id, fragments);

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.phase == Phase::ReservedLocal {
                stream.phase = Phase::HalfClosedRemote;
            }
        }
        if end_stream {
            self.close_local(stream_id);
        }
        Ok(())
    }

    /// Queues a DATA frame.
    ///
    /// # Errors
    ///
    /// [`H2Error::StreamClosed`] when the stream cannot send and
    /// [`H2Error::FlowControl`] when `data` exceeds the window or frame size.
    pub fn send_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<(), H2Error> {
        let window = self.local_flow_control_window(stream_id)?;
        if data.len() > window as usize || data.len() > self.remote.max_frame_size as usize {
            return Err(H2Error::FlowControl(stream_id, data.len()));
        }
        let len = data.len() as u32;
        self.send_window.consume(len);
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send.consume(len);
        }
        self.queue(Frame::Data {
            stream_id,
            payload: data,
            end_stream,
            flow_len: len,
        });
        if end_stream {
            self.close_local(stream_id);
        }
        Ok(())
    }

    /// Queues an empty DATA frame with END_STREAM.
    ///
    /// # Errors
    ///
    /// [`H2Error::StreamClosed`] when the stream cannot send.
    pub fn end_stream(&mut self, stream_id: u32) -> Result<(), H2Error> {
        self.send_data(stream_id, Bytes::new(), true)
    }

    /// Returns processed bytes to the peer's send window.
    pub fn acknowledge_received_data(&mut self, len: u32, stream_id: u32) {
        if len == 0 || self.failed {
            return;
        }
        self.recv_window.increase(i64::from(len));
        self.queue(Frame::WindowUpdate {
            stream_id: 0,
            increment: len,
        });
        let stream_open = match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.remote_open() => {
                stream.recv.increase(i64::from(len));
                true
            }
            _ => false,
        };
        if stream_open {
            self.queue(Frame::WindowUpdate {
                stream_id,
                increment: len,
            });
        }
    }

    pub fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        self.streams.remove(&stream_id);
        self.queue(Frame::RstStream { stream_id, code });
    }

    /// Announces a new concurrency limit.
    pub fn update_max_concurrent_streams(&mut self, max: u32) {
        self.local.max_concurrent_streams = Some(max);
        self.queue(Frame::Settings {
            ack: false,
            params: vec![Setting::MaxConcurrentStreams(max)],
        });
    }

    /// Queues GOAWAY once. Streams already open may finish; new ones are
    /// refused.
    pub fn close_connection(&mut self, code: ErrorCode) {
        self.send_goaway(code, String::new());
    }

    /// Promises a pushed response on `stream_id`. Returns the promised
    /// stream, reserved for the server.
    ///
    /// # Errors
    ///
    /// [`H2Error::PushRefused`] when the peer disabled push or the parent
    /// is itself a pushed stream, [`H2Error::StreamClosed`] when the parent
    /// cannot send.
    pub fn push_stream(&mut self, stream_id: u32, headers: &Headers) -> Result<u32, H2Error> {
        if !self.remote.enable_push || stream_id % 2 == 0 || self.goaway_sent {
            return Err(H2Error::PushRefused);
        }
        self.sendable(stream_id)?;
        let promised_stream_id = self.next_push_stream;
        self.next_push_stream += 2;

        let block = self.encode_headers(headers);
        // The promised stream id takes four bytes of the first frame.
        let max = self.remote.max_frame_size as usize - 4;
        let mut block = Bytes::from(block);
        let first = block.split_to(block.len().min(max));
        let rest = self.fragments(block.to_vec());
        let rest: Vec<Bytes> = rest.into_iter().filter(|fragment| !fragment.is_empty()).collect();
        self.queue(Frame::PushPromise {
            stream_id,
            promised_stream_id,
            block: first,
            end_headers: rest.is_empty(),
        });
        self.queue_continuations(stream_id, rest);

        self.streams.insert(
            promised_stream_id,
            StreamEntry {
                phase: Phase::ReservedLocal,
                send: Window::new(self.remote.initial_window_size),
                recv: Window::new(0),
            },
        );
        Ok(promised_stream_id)
    }

    /// Streams opened by the peer and not yet closed.
    pub fn open_remote_streams(&self) -> usize {
        self.streams.keys().filter(|id| *id % 2 == 1).count()
    }

    fn sendable(&self, stream_id: u32) -> Result<&StreamEntry, H2Error> {
        match self.streams.get(&stream_id) {
            Some(stream) if stream.local_open() && !self.failed => Ok(stream),
            _ => Err(H2Error::StreamClosed(stream_id)),
        }
    }

    fn encode_headers(&mut self, headers: &Headers) -> Vec<u8> {
        self.encoder
            .encode(headers.iter().map(|(name, value)| (name.as_bytes(), value.as_bytes())))
    }

    /// Splits a header block by the peer's frame size. Always yields at
    /// least one fragment.
    fn fragments(&self, block: Vec<u8>) -> Vec<Bytes> {
        let max = self.remote.max_frame_size as usize;
        let mut block = Bytes::from(block);
        let mut fragments = Vec::with_capacity(block.len() / max + 1);
        loop {
            let fragment = block.split_to(block.len().min(max));
            fragments.push(fragment);
            if block.is_empty() {
                return fragments;
            }
        }
    }

    fn queue_continuations(&mut self, stream_id: u32, fragments: Vec<Bytes>) {
        let count = fragments.len();
        for (index, block) in fragments.into_iter().enumerate() {
            self.queue(Frame::Continuation {
                stream_id,
                block,
                end_headers: index + 1 == count,
            });
        }
    }

    fn queue(&mut self, frame: Frame) {
        trace!(?frame, "queue frame");
        frame.encode(&mut self.outbound);
    }

    fn send_goaway(&mut self, code: ErrorCode, reason: String) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        self.queue(Frame::GoAway {
            last_stream_id: self.highest_remote_stream,
            code,
            debug_data: Bytes::from(reason),
        });
    }

    fn close_local(&mut self, stream_id: u32) {
        let remove = match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.phase == Phase::Open => {
                stream.phase = Phase::HalfClosedLocal;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            self.streams.remove(&stream_id);
        }
    }

    fn close_remote(&mut self, stream_id: u32) {
        let remove = match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.phase == Phase::Open => {
                stream.phase = Phase::HalfClosedRemote;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            self.streams.remove(&stream_id);
        }
    }

    fn process(&mut self, events: &mut Vec<H2Event>) -> Result<(), H2Error> {
        if !self.preface_received {
            let len = self.inbound.len().min(PREFACE.len());
            if self.inbound[..len] != PREFACE[..len] {
                return Err(H2Error::protocol("invalid connection preface"));
            }
            if len < PREFACE.len() {
                return Ok(());
            }
            let _ = self.inbound.split_to(PREFACE.len());
            self.preface_received = true;
        }

        while let Some(frame) = frame::decode(&mut self.inbound, self.local.max_frame_size)? {
            trace!(?frame, "received frame");
            if !self.settings_received && !matches!(frame, Frame::Settings { ack: false, .. }) {
                return Err(H2Error::protocol("first frame must be SETTINGS"));
            }
            self.on_frame(frame, events)?;
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, events: &mut Vec<H2Event>) -> Result<(), H2Error> {
        if let Some(pending) = &self.continuation {
            let expected = pending.stream_id;
            if !matches!(frame, Frame::Continuation { stream_id, .. } if stream_id == expected) {
                return Err(H2Error::protocol("expected CONTINUATION"));
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                flow_len,
            } => self.on_data(stream_id, payload, end_stream, flow_len, events)?,
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let pending = PendingHeaders {
                    stream_id,
                    end_stream,
                    priority,
                    block: BytesMut::from(&block[..]),
                };
                if end_headers {
                    self.on_header_block(pending, events)?;
                } else {
                    self.continuation = Some(pending);
                }
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let limit = self.local.max_header_list_size.unwrap_or(u32::MAX) as usize;
                let Some(pending) = self.continuation.as_mut() else {
                    return Err(H2Error::protocol("unexpected CONTINUATION"));
                };
                pending.block.extend_from_slice(&block);
                if pending.block.len() > limit {
                    return Err(H2Error::connection(ErrorCode::EnhanceYourCalm, "header block too large"));
                }
                if end_headers {
                    if let Some(pending) = self.continuation.take() {
                        self.on_header_block(pending, events)?;
                    }
                }
            }
            Frame::Priority { stream_id, priority } => {
                if priority.dependency == stream_id {
                    self.reset_with_event(stream_id, ErrorCode::ProtocolError, events);
                } else {
                    events.push(priority_event(stream_id, priority));
                }
            }
            Frame::RstStream { stream_id, code } => {
                if self.is_idle_stream(stream_id) {
                    return Err(H2Error::protocol("RST_STREAM on an idle stream"));
                }
                if self.streams.remove(&stream_id).is_some() {
                    events.push(H2Event::StreamReset { stream_id, code });
                }
            }
            Frame::Settings { ack: true, .. } => {}
            Frame::Settings { ack: false, params } => {
                let mut initial_window_size_changed = false;
                for setting in params {
                    initial_window_size_changed |= matches!(setting, Setting::InitialWindowSize(_));
                    self.apply_remote(setting)?;
                }
                self.settings_received = true;
                self.queue(Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                });
                events.push(H2Event::RemoteSettingsChanged {
                    initial_window_size_changed,
                });
            }
            Frame::PushPromise { .. } => return Err(H2Error::protocol("clients cannot push")),
            Frame::Ping { ack, payload } => {
                if !ack {
                    self.queue(Frame::Ping { ack: true, payload });
                }
            }
            Frame::GoAway {
                last_stream_id, code, ..
            } => events.push(H2Event::ConnectionTerminated { code, last_stream_id }),
            Frame::WindowUpdate { stream_id, increment } => {
                self.on_window_update(stream_id, increment, events)?;
            }
            Frame::Unknown { frame_type, .. } => trace!(frame_type, "ignoring unknown frame"),
        }
        Ok(())
    }

    fn apply_remote(&mut self, setting: Setting) -> Result<(), H2Error> {
        match setting {
            Setting::InitialWindowSize(size) => {
                let delta = i64::from(size) - i64::from(self.remote.initial_window_size);
                for stream in self.streams.values_mut() {
                    if !stream.send.increase(delta) {
                        return Err(H2Error::connection(
                            ErrorCode::FlowControlError,
                            "INITIAL_WINDOW_SIZE overflows a stream window",
                        ));
                    }
                }
            }
            Setting::HeaderTableSize(size) => self.encoder.set_max_table_size(size as usize),
            _ => {}
        }
        self.remote.apply(setting);
        Ok(())
    }

    fn is_idle_stream(&self, stream_id: u32) -> bool {
        if stream_id % 2 == 1 {
            stream_id > self.highest_remote_stream
        } else {
            stream_id >= self.next_push_stream
        }
    }

    fn reset_with_event(&mut self, stream_id: u32, code: ErrorCode, events: &mut Vec<H2Event>) {
        let known = self.streams.contains_key(&stream_id);
        self.reset_stream(stream_id, code);
        if known {
            events.push(H2Event::StreamReset { stream_id, code });
        }
    }

    fn on_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        flow_len: u32,
        events: &mut Vec<H2Event>,
    ) -> Result<(), H2Error> {
        if !self.recv_window.consume(flow_len) {
            return Err(H2Error::connection(
                ErrorCode::FlowControlError,
                "DATA exceeds the connection window",
            ));
        }
        if self.is_idle_stream(stream_id) {
            return Err(H2Error::protocol("DATA on an idle stream"));
        }

        let accepted = match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.remote_open() => {
                if stream.recv.consume(flow_len) {
                    Ok(())
                } else {
                    Err(ErrorCode::FlowControlError)
                }
            }
            _ => Err(ErrorCode::StreamClosed),
        };
        if let Err(code) = accepted {
            // Nobody will acknowledge these bytes; hand the connection
            // window back now.
            self.acknowledge_received_data(flow_len, 0);
            self.reset_with_event(stream_id, code, events);
            return Ok(());
        }

        events.push(H2Event::DataReceived {
            stream_id,
            data,
            flow_controlled_length: flow_len,
        });
        if end_stream {
            self.close_remote(stream_id);
            events.push(H2Event::StreamEnded { stream_id });
        }
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32, events: &mut Vec<H2Event>) -> Result<(), H2Error> {
        if stream_id == 0 {
            if increment == 0 {
                return Err(H2Error::protocol("zero WINDOW_UPDATE increment"));
            }
            if !self.send_window.increase(i64::from(increment)) {
                return Err(H2Error::connection(
                    ErrorCode::FlowControlError,
                    "connection window overflow",
                ));
            }
            events.push(H2Event::WindowUpdated { stream_id });
            return Ok(());
        }

        if self.is_idle_stream(stream_id) {
            return Err(H2Error::protocol("WINDOW_UPDATE on an idle stream"));
        }
        let outcome = match self.streams.get_mut(&stream_id) {
            None => return Ok(()),
            Some(_) if increment == 0 => Err(ErrorCode::ProtocolError),
            Some(stream) => {
                if stream.send.increase(i64::from(increment)) {
                    Ok(())
                } else {
                    Err(ErrorCode::FlowControlError)
                }
            }
        };
        match outcome {
            Ok(()) => events.push(H2Event::WindowUpdated { stream_id }),
            Err(code) => self.reset_with_event(stream_id, code, events),
        }
        Ok(())
    }

    fn on_header_block(&mut self, pending: PendingHeaders, events: &mut Vec<H2Event>) -> Result<(), H2Error> {
        let PendingHeaders {
            stream_id,
            end_stream,
            priority,
            block,
        } = pending;
        // Always decode so the dynamic table stays in sync, even for
        // streams that are about to be refused.
        let decoded = self.decoder.decode(&block).map_err(|e| H2Error::Hpack(e.to_string()))?;

        if let Some(stream) = self.streams.get(&stream_id) {
            // Trailers.
            if !stream.remote_open() {
                self.reset_with_event(stream_id, ErrorCode::StreamClosed, events);
            } else if !end_stream {
                self.reset_with_event(stream_id, ErrorCode::ProtocolError, events);
            } else {
                self.close_remote(stream_id);
                events.push(H2Event::StreamEnded { stream_id });
            }
            return Ok(());
        }

        if stream_id % 2 == 0 || stream_id <= self.highest_remote_stream {
            return Err(H2Error::connection(
                ErrorCode::ProtocolError,
                format!("HEADERS on closed or server stream {stream_id}"),
            ));
        }
        self.highest_remote_stream = stream_id;

        if self.goaway_sent {
            self.reset_stream(stream_id, ErrorCode::RefusedStream);
            return Ok(());
        }

        let max_concurrent = self.local.max_concurrent_streams.unwrap_or(u32::MAX) as usize;
        if self.open_remote_streams() >= max_concurrent {
            debug!(stream_id, "refusing stream over the concurrency limit");
            self.reset_stream(stream_id, ErrorCode::RefusedStream);
            return Ok(());
        }

        let Some(headers) = self.request_headers(decoded) else {
            self.reset_stream(stream_id, ErrorCode::ProtocolError);
            return Ok(());
        };
        if priority.is_some_and(|p| p.dependency == stream_id) {
            debug!(stream_id, "stream depends on itself");
            self.reset_stream(stream_id, ErrorCode::ProtocolError);
            return Ok(());
        }

        self.streams.insert(
            stream_id,
            StreamEntry {
                phase: if end_stream { Phase::HalfClosedRemote } else { Phase::Open },
                send: Window::new(self.remote.initial_window_size),
                recv: Window::new(self.local.initial_window_size),
            },
        );
        events.push(H2Event::RequestReceived { stream_id, headers });
        if let Some(priority) = priority {
            events.push(priority_event(stream_id, priority));
        }
        if end_stream {
            events.push(H2Event::StreamEnded { stream_id });
        }
        Ok(())
    }

    /// Validates a decoded request header list. `None` for a malformed
    /// request.
    fn request_headers(&self, decoded: Vec<(Vec<u8>, Vec<u8>)>) -> Option<Headers> {
        let limit = self.local.max_header_list_size.unwrap_or(u32::MAX) as usize;
        let size: usize = decoded.iter().map(|(name, value)| name.len() + value.len() + 32).sum();
        if size > limit {
            debug!(size, limit, "header list too large");
            return None;
        }

        let mut headers = Headers::with_capacity(decoded.len());
        let mut regular_seen = false;
        for (name, value) in decoded {
            let name = String::from_utf8(name).ok()?;
            if name.bytes().any(|b| b.is_ascii_uppercase()) {
                return None;
            }
            if name.starts_with(':') {
                if regular_seen {
                    return None;
                }
            } else {
                regular_seen = true;
            }
            headers.insert(name, String::from_utf8_lossy(&value).into_owned());
        }

        let method = headers.get(":method")?;
        let extended_connect = headers.contains(":protocol");
        if (method != "CONNECT" || extended_connect) && !headers.contains(":path") {
            return None;
        }
        Some(headers)
    }
}

fn priority_event(stream_id: u32, priority: Priority) -> H2Event {
    H2Event::PriorityUpdated {
        stream_id,
        depends_on: priority.dependency,
        weight: priority.weight(),
        exclusive: priority.exclusive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::h2::frame::{FLAG_END_HEADERS, FLAG_END_STREAM};

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf.to_vec()
    }

    fn decode_frames(bytes: Bytes) -> Vec<Frame> {
        let mut buf = BytesMut::from(&bytes[..]);
        let mut frames = Vec::new();
        while let Some(frame) = frame::decode(&mut buf, 1 << 24).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn request_block(path: &str, extra: &[(&str, &str)]) -> Bytes {
        let mut encoder = loona_hpack::Encoder::new();
        let mut headers = vec![
            (&b":method"[..], &b"GET"[..]),
            (&b":scheme"[..], &b"http"[..]),
            (&b":path"[..], path.as_bytes()),
            (&b":authority"[..], &b"example.com"[..]),
        ];
        headers.extend(extra.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        Bytes::from(encoder.encode(headers))
    }

    fn headers_frame(stream_id: u32, block: Bytes, end_stream: bool) -> Vec<u8> {
        encode(Frame::Headers {
            stream_id,
            block,
            end_stream,
            end_headers: true,
            priority: None,
        })
    }

    /// A connection that has exchanged prefaces, with its output cleared.
    fn started() -> H2Connection {
        let mut conn = H2Connection::new(&Config::default());
        conn.initiate_connection();
        let mut bytes = PREFACE.to_vec();
        bytes.extend(encode(Frame::Settings {
            ack: false,
            params: Vec::new(),
        }));
        let events = conn.receive_data(&bytes).unwrap();
        assert_eq!(
            events,
            vec![H2Event::RemoteSettingsChanged {
                initial_window_size_changed: false
            }]
        );
        conn.data_to_send();
        conn
    }

    #[test]
    fn settings_are_sent_and_acknowledged() {
        let mut conn = H2Connection::new(&Config::default());
        conn.initiate_connection();
        let mut bytes = PREFACE.to_vec();
        bytes.extend(encode(Frame::Settings {
            ack: false,
            params: vec![Setting::MaxFrameSize(32_768)],
        }));
        conn.receive_data(&bytes).unwrap();
        assert_eq!(conn.max_outbound_frame_size(), 32_768);

        let frames = decode_frames(conn.data_to_send());
        match &frames[0] {
            Frame::Settings { ack: false, params } => {
                assert!(params.contains(&Setting::MaxConcurrentStreams(100)));
                assert!(params.contains(&Setting::EnableConnectProtocol(true)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            frames[1],
            Frame::Settings {
                ack: true,
                params: Vec::new()
            }
        );
    }

    #[test]
    fn preface_arrives_in_pieces() {
        let mut conn = H2Connection::new(&Config::default());
        assert!(conn.receive_data(&PREFACE[..10]).unwrap().is_empty());
        assert!(conn.receive_data(&PREFACE[10..]).unwrap().is_empty());
        assert!(conn.receive_data(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0]).is_ok());
    }

    #[test]
    fn bad_preface_sends_goaway() {
        let mut conn = H2Connection::new(&Config::default());
        let err = conn.receive_data(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
        let frames = decode_frames(conn.data_to_send());
        assert!(matches!(
            frames[0],
            Frame::GoAway {
                code: ErrorCode::ProtocolError,
                ..
            }
        ));
        // Further input is ignored.
        assert!(conn.receive_data(b"more").unwrap().is_empty());
    }

    #[test]
    fn request_with_body() {
        let mut conn = started();
        let mut bytes = headers_frame(1, request_block("/upload", &[("content-type", "text/plain")]), false);
        bytes.extend(encode(Frame::Data {
            stream_id: 1,
            payload: Bytes::from_static(b"hello"),
            end_stream: true,
            flow_len: 5,
        }));
        let events = conn.receive_data(&bytes).unwrap();
        assert_eq!(events.len(), 3);
        match &events[0] {
            H2Event::RequestReceived { stream_id, headers } => {
                assert_eq!(*stream_id, 1);
                assert_eq!(headers.get(":path"), Some("/upload"));
                assert_eq!(headers.get("content-type"), Some("text/plain"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events[1],
            H2Event::DataReceived {
                stream_id: 1,
                data: Bytes::from_static(b"hello"),
                flow_controlled_length: 5,
            }
        );
        assert_eq!(events[2], H2Event::StreamEnded { stream_id: 1 });

        conn.acknowledge_received_data(5, 1);
        let frames = decode_frames(conn.data_to_send());
        assert_eq!(
            frames,
            vec![Frame::WindowUpdate {
                stream_id: 0,
                increment: 5
            }]
        );
    }

    #[test]
    fn header_block_split_over_continuation() {
        let mut conn = started();
        let block = request_block("/", &[]);
        let (first, second) = block.split_at(3);
        let mut bytes = encode(Frame::Headers {
            stream_id: 1,
            block: Bytes::copy_from_slice(first),
            end_stream: true,
            end_headers: false,
            priority: None,
        });
        assert!(conn.receive_data(&bytes).unwrap().is_empty());
        bytes = encode(Frame::Continuation {
            stream_id: 1,
            block: Bytes::copy_from_slice(second),
            end_headers: true,
        });
        let events = conn.receive_data(&bytes).unwrap();
        assert!(matches!(events[0], H2Event::RequestReceived { stream_id: 1, .. }));
        assert_eq!(events[1], H2Event::StreamEnded { stream_id: 1 });
    }

    #[test]
    fn interleaved_frame_during_continuation_is_fatal() {
        let mut conn = started();
        let mut bytes = encode(Frame::Headers {
            stream_id: 1,
            block: request_block("/", &[]),
            end_stream: true,
            end_headers: false,
            priority: None,
        });
        bytes.extend(encode(Frame::Ping {
            ack: false,
            payload: [0; 8],
        }));
        assert!(conn.receive_data(&bytes).is_err());
    }

    #[test]
    fn response_headers_and_data() {
        let mut conn = started();
        conn.receive_data(&headers_frame(1, request_block("/", &[]), true)).unwrap();

        let response: Headers = [(":status", "200"), ("content-length", "2")].into_iter().collect();
        conn.send_headers(1, &response, false).unwrap();
        assert_eq!(conn.local_flow_control_window(1).unwrap(), DEFAULT_WINDOW_SIZE);
        conn.send_data(1, Bytes::from_static(b"ok"), false).unwrap();
        conn.end_stream(1).unwrap();

        let frames = decode_frames(conn.data_to_send());
        assert_eq!(frames.len(), 3);
        match &frames[0] {
            Frame::Headers {
                stream_id: 1,
                block,
                end_stream: false,
                end_headers: true,
                ..
            } => {
                let decoded = loona_hpack::Decoder::new().decode(block).unwrap();
                assert_eq!(decoded[0], (b":status".to_vec(), b"200".to_vec()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&frames[1], Frame::Data { payload, end_stream: false, .. } if &payload[..] == b"ok"));
        assert!(matches!(&frames[2], Frame::Data { end_stream: true, .. }));
        // Both sides closed.
        assert_eq!(conn.send_data(1, Bytes::from_static(b"x"), false), Err(H2Error::StreamClosed(1)));
    }

    #[test]
    fn send_respects_flow_control() {
        let mut conn = started();
        let mut bytes = encode(Frame::Settings {
            ack: false,
            params: vec![Setting::InitialWindowSize(4)],
        });
        bytes.extend(headers_frame(1, request_block("/", &[]), true));
        let events = conn.receive_data(&bytes).unwrap();
        assert_eq!(
            events[0],
            H2Event::RemoteSettingsChanged {
                initial_window_size_changed: true
            }
        );
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 4);
        assert_eq!(
            conn.send_data(1, Bytes::from_static(b"hello"), false),
            Err(H2Error::FlowControl(1, 5))
        );
        conn.send_data(1, Bytes::from_static(b"hell"), false).unwrap();
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 0);

        let events = conn
            .receive_data(&encode(Frame::WindowUpdate {
                stream_id: 1,
                increment: 10,
            }))
            .unwrap();
        assert_eq!(events, vec![H2Event::WindowUpdated { stream_id: 1 }]);
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 10);
    }

    #[test]
    fn inbound_data_beyond_the_window_is_fatal() {
        let mut conn = started();
        conn.receive_data(&headers_frame(1, request_block("/", &[]), false)).unwrap();
        let chunk = Bytes::from(vec![0; 16_384]);
        let mut bytes = Vec::new();
        for _ in 0..4 {
            bytes.extend(encode(Frame::Data {
                stream_id: 1,
                payload: chunk.clone(),
                end_stream: false,
                flow_len: 16_384,
            }));
        }
        let err = conn.receive_data(&bytes).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FlowControlError);
    }

    #[test]
    fn streams_over_the_limit_are_refused() {
        let config = Config {
            h2_max_concurrent_streams: 1,
            ..Config::default()
        };
        let mut conn = H2Connection::new(&config);
        let mut bytes = PREFACE.to_vec();
        bytes.extend(encode(Frame::Settings {
            ack: false,
            params: Vec::new(),
        }));
        bytes.extend(headers_frame(1, request_block("/a", &[]), true));
        bytes.extend(headers_frame(3, request_block("/b", &[]), true));
        let events = conn.receive_data(&bytes).unwrap();
        let requests = events
            .iter()
            .filter(|e| matches!(e, H2Event::RequestReceived { .. }))
            .count();
        assert_eq!(requests, 1);
        let frames = decode_frames(conn.data_to_send());
        assert!(frames.contains(&Frame::RstStream {
            stream_id: 3,
            code: ErrorCode::RefusedStream
        }));
    }

    #[test]
    fn ping_is_answered() {
        let mut conn = started();
        conn.receive_data(&encode(Frame::Ping {
            ack: false,
            payload: *b"12345678",
        }))
        .unwrap();
        assert_eq!(
            decode_frames(conn.data_to_send()),
            vec![Frame::Ping {
                ack: true,
                payload: *b"12345678"
            }]
        );
    }

    #[test]
    fn peer_reset_and_goaway_are_reported() {
        let mut conn = started();
        conn.receive_data(&headers_frame(1, request_block("/", &[]), false)).unwrap();
        let events = conn
            .receive_data(&encode(Frame::RstStream {
                stream_id: 1,
                code: ErrorCode::Cancel,
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![H2Event::StreamReset {
                stream_id: 1,
                code: ErrorCode::Cancel
            }]
        );
        assert_eq!(conn.local_flow_control_window(1), Err(H2Error::StreamClosed(1)));

        let events = conn
            .receive_data(&encode(Frame::GoAway {
                last_stream_id: 1,
                code: ErrorCode::NoError,
                debug_data: Bytes::new(),
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![H2Event::ConnectionTerminated {
                code: ErrorCode::NoError,
                last_stream_id: 1
            }]
        );
    }

    #[test]
    fn requests_without_a_path_are_reset() {
        let mut conn = started();
        let mut encoder = loona_hpack::Encoder::new();
        let block = Bytes::from(encoder.encode(vec![(&b":method"[..], &b"GET"[..])]));
        let events = conn.receive_data(&headers_frame(1, block, true)).unwrap();
        assert!(events.is_empty());
        assert_eq!(
            decode_frames(conn.data_to_send()),
            vec![Frame::RstStream {
                stream_id: 1,
                code: ErrorCode::ProtocolError
            }]
        );
    }

    #[test]
    fn self_dependent_headers_are_reset() {
        let mut conn = started();
        let bytes = encode(Frame::Headers {
            stream_id: 1,
            block: request_block("/", &[]),
            end_stream: true,
            end_headers: true,
            priority: Some(Priority {
                exclusive: false,
                dependency: 1,
                weight: 15,
            }),
        });
        let events = conn.receive_data(&bytes).unwrap();
        assert!(events.is_empty());
        assert_eq!(
            decode_frames(conn.data_to_send()),
            vec![Frame::RstStream {
                stream_id: 1,
                code: ErrorCode::ProtocolError
            }]
        );

        // The connection survives and later streams still open.
        let events = conn.receive_data(&headers_frame(3, request_block("/next", &[]), true)).unwrap();
        assert!(matches!(events[0], H2Event::RequestReceived { stream_id: 3, .. }));
    }

    #[test]
    fn extended_connect_is_accepted() {
        let mut conn = started();
        let mut encoder = loona_hpack::Encoder::new();
        let block = Bytes::from(encoder.encode(vec![
            (&b":method"[..], &b"CONNECT"[..]),
            (&b":protocol"[..], &b"websocket"[..]),
            (&b":scheme"[..], &b"https"[..]),
            (&b":path"[..], &b"/chat"[..]),
            (&b":authority"[..], &b"example.com"[..]),
        ]));
        let events = conn.receive_data(&headers_frame(1, block, false)).unwrap();
        assert!(matches!(&events[0], H2Event::RequestReceived { headers, .. } if headers.get(":protocol") == Some("websocket")));
    }

    #[test]
    fn goaway_refuses_later_streams() {
        let mut conn = started();
        conn.receive_data(&headers_frame(1, request_block("/", &[]), true)).unwrap();
        conn.close_connection(ErrorCode::NoError);
        let events = conn.receive_data(&headers_frame(3, request_block("/", &[]), true)).unwrap();
        assert!(events.is_empty());
        let frames = decode_frames(conn.data_to_send());
        assert_eq!(
            frames,
            vec![
                Frame::GoAway {
                    last_stream_id: 1,
                    code: ErrorCode::NoError,
                    debug_data: Bytes::new(),
                },
                Frame::RstStream {
                    stream_id: 3,
                    code: ErrorCode::RefusedStream
                },
            ]
        );
        // The open stream can still answer.
        let response: Headers = [(":status", "204")].into_iter().collect();
        conn.send_headers(1, &response, true).unwrap();
    }

    #[test]
    fn upgrade_opens_stream_one() {
        let mut conn = H2Connection::new(&Config::default());
        // SETTINGS_MAX_FRAME_SIZE = 32768
        let settings = URL_SAFE_NO_PAD.encode([0u8, 0x5, 0, 0, 0x80, 0]);
        conn.initiate_upgrade_connection(&settings).unwrap();
        assert_eq!(conn.max_outbound_frame_size(), 32_768);
        let response: Headers = [(":status", "200")].into_iter().collect();
        conn.send_headers(1, &response, true).unwrap();
        let frames = decode_frames(conn.data_to_send());
        assert!(matches!(frames[0], Frame::Settings { ack: false, .. }));
        assert!(matches!(frames[1], Frame::Headers { stream_id: 1, end_stream: true, .. }));
        assert!(conn.initiate_upgrade_connection("!!!").is_err());
    }

    #[test]
    fn push_promise_reserves_an_even_stream() {
        let mut conn = started();
        conn.receive_data(&headers_frame(1, request_block("/", &[]), true)).unwrap();
        let promised: Headers = [(":method", "GET"), (":path", "/style.css")].into_iter().collect();
        assert_eq!(conn.push_stream(1, &promised), Ok(2));
        assert_eq!(conn.push_stream(1, &promised), Ok(4));
        assert_eq!(conn.push_stream(2, &promised), Err(H2Error::PushRefused));

        let frames = decode_frames(conn.data_to_send());
        assert!(matches!(
            frames[0],
            Frame::PushPromise {
                stream_id: 1,
                promised_stream_id: 2,
                end_headers: true,
                ..
            }
        ));
        let response: Headers = [(":status", "200")].into_iter().collect();
        conn.send_headers(2, &response, false).unwrap();
        conn.end_stream(2).unwrap();
    }

    #[test]
    fn push_is_refused_when_disabled() {
        let mut conn = started();
        let mut bytes = encode(Frame::Settings {
            ack: false,
            params: vec![Setting::EnablePush(false)],
        });
        bytes.extend(headers_frame(1, request_block("/", &[]), true));
        conn.receive_data(&bytes).unwrap();
        let promised: Headers = [(":method", "GET"), (":path", "/a")].into_iter().collect();
        assert_eq!(conn.push_stream(1, &promised), Err(H2Error::PushRefused));
    }

    #[test]
    fn flags_are_on_the_wire() {
        let bytes = headers_frame(1, Bytes::from_static(&[0x82]), true);
        assert_eq!(bytes[4], FLAG_END_STREAM | FLAG_END_HEADERS);
    }
}
