//! WebSocket stream handler, for both HTTP/1.1 upgrades and HTTP/2 extended
//! CONNECT.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::time::{Instant, interval_at};
use tracing::debug;

use super::{Effect, Peers, RequestTarget, StreamCore, error_response, valid_server_name};
use crate::app::{
    InboundMessage, MessageSink, OutboundMessage, Scope, SendError, WebsocketExtensions, WebsocketScope,
};
use crate::config::Config;
use crate::events::ProtocolEvent;
use crate::http::headers::build_and_validate_headers;
use crate::http::{Headers, Method, StatusCode, suppress_body};
use crate::protocol::{ProtocolContext, StreamSink};
use crate::realtime::{Handshake, WsConnection, WsEvent, WsOutbound, WsState, close_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsStreamState {
    /// Waiting for the application to accept or reject.
    Handshake,
    Connected,
    /// Sending an HTTP rejection.
    Response,
    Closed,
    /// The rejection has been sent in full.
    HttpClosed,
}

impl WsStreamState {
    fn name(self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::Connected => "CONNECTED",
            Self::Response => "RESPONSE",
            Self::Closed => "CLOSED",
            Self::HttpClosed => "HTTPCLOSED",
        }
    }
}

#[derive(Debug)]
pub(crate) struct WsMachine {
    stream_id: u32,
    peers: Peers,
    state: WsStreamState,
    closed: bool,
    /// `StreamClosed` has been emitted.
    ended: bool,
    handshake: Handshake,
    path: String,
    /// Frames that arrived before the application accepted.
    pending: BytesMut,
    connection: Option<WsConnection>,
    response: Option<(StatusCode, Headers)>,
    /// Close code reported to the application on disconnect.
    close_code: Option<u16>,
    max_message_size: usize,
    heartbeat: bool,
}

impl WsMachine {
    pub(crate) fn new(stream_id: u32, peers: Peers, config: &Config) -> Self {
        Self {
            stream_id,
            peers,
            state: WsStreamState::Handshake,
            closed: false,
            ended: false,
            handshake: Handshake::default(),
            path: String::new(),
            pending: BytesMut::new(),
            connection: None,
            response: None,
            close_code: None,
            max_message_size: config.websocket_max_message_size,
            heartbeat: config.websocket_ping_interval().is_some_and(|p| !p.is_zero()),
        }
    }

    pub(crate) fn state(&self) -> WsStreamState {
        self.state
    }

    fn access_log(&self, status: StatusCode) -> Effect {
        Effect::AccessLog {
            method: Method::Get,
            path: self.path.clone(),
            status: Some(status.as_u16()),
        }
    }

    fn end(&mut self) -> Option<Effect> {
        if std::mem::replace(&mut self.ended, true) {
            return None;
        }
        Some(Effect::Emit(ProtocolEvent::StreamClosed {
            stream_id: self.stream_id,
        }))
    }

    /// Rejects with a bodiless HTTP response.
    fn http_error(&mut self, status: StatusCode) -> Vec<Effect> {
        self.state = WsStreamState::HttpClosed;
        let mut effects: Vec<Effect> = error_response(self.stream_id, status)
            .into_iter()
            .map(Effect::Emit)
            .collect();
        effects.push(self.access_log(status));
        effects
    }

    pub(crate) fn on_event(&mut self, event: ProtocolEvent, config: &Config) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        match event {
            ProtocolEvent::Request {
                headers,
                http_version,
                raw_path,
                ..
            } => {
                self.handshake = Handshake::new(&headers, http_version);
                let target = RequestTarget::parse(&raw_path);
                self.path = target.path.clone();

                let rejection = if !valid_server_name(config, &headers) {
                    Some(StatusCode::NOT_FOUND)
                } else if !self.handshake.is_valid() {
                    Some(StatusCode::BAD_REQUEST)
                } else {
                    None
                };
                if let Some(status) = rejection {
                    let mut effects = self.http_error(status);
                    effects.extend(self.end());
                    return effects;
                }

                let scope = WebsocketScope {
                    http_version,
                    scheme: "ws",
                    path: target.path,
                    raw_path: target.raw_path,
                    query_string: target.query_string,
                    subprotocols: self.handshake.subprotocols().to_vec(),
                    headers,
                    client: self.peers.client,
                    server: self.peers.server,
                    extensions: WebsocketExtensions {
                        websocket_http_response: true,
                    },
                };
                vec![
                    Effect::SpawnApp(Scope::Websocket(scope)),
                    Effect::Deliver(InboundMessage::WebsocketConnect),
                ]
            }
            ProtocolEvent::Body { data, .. } | ProtocolEvent::Data { data, .. } => self.receive(&data),
            ProtocolEvent::StreamClosed { .. } => {
                self.closed = true;
                let code = self.close_code.unwrap_or(match self.state {
                    WsStreamState::Closed | WsStreamState::HttpClosed => close_code::NORMAL,
                    _ => close_code::ABNORMAL,
                });
                vec![Effect::Disconnect(InboundMessage::WebsocketDisconnect { code })]
            }
            _ => Vec::new(),
        }
    }

    fn receive(&mut self, data: &[u8]) -> Vec<Effect> {
        match self.state {
            WsStreamState::Handshake => {
                if self.pending.len() + data.len() > self.max_message_size {
                    debug!(stream_id = self.stream_id, "too much data before websocket accept");
                    self.close_code = Some(close_code::MESSAGE_TOO_BIG);
                    return self.end().into_iter().collect();
                }
                self.pending.extend_from_slice(data);
                Vec::new()
            }
            // After a local close, keep reading until the peer's close reply.
            WsStreamState::Connected | WsStreamState::Closed if !self.ended => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.receive_data(data);
                }
                self.drain()
            }
            _ => Vec::new(),
        }
    }

    /// Turns buffered frames into effects until more input is needed.
    fn drain(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            let Some(connection) = self.connection.as_mut() else {
                return effects;
            };
            match connection.next_event() {
                Ok(None) => return effects,
                Ok(Some(WsEvent::Message(message))) => {
                    effects.push(Effect::Deliver(InboundMessage::WebsocketReceive(message)));
                }
                Ok(Some(WsEvent::Ping(payload))) => {
                    if let Ok(data) = connection.send(WsOutbound::Pong(payload)) {
                        effects.push(data_frame(self.stream_id, data));
                    }
                }
                Ok(Some(WsEvent::Pong(_))) => {}
                Ok(Some(WsEvent::Close { code, .. })) => {
                    self.close_code = Some(code.unwrap_or(close_code::NO_STATUS));
                    if connection.state() == WsState::RemoteClosing {
                        let reply = WsOutbound::Close {
                            code: code.filter(|c| close_code::is_sendable(*c)).unwrap_or(close_code::NORMAL),
                            reason: String::new(),
                        };
                        if let Ok(data) = connection.send(reply) {
                            effects.push(data_frame(self.stream_id, data));
                        }
                    }
                    self.state = WsStreamState::Closed;
                    effects.extend(self.end());
                    return effects;
                }
                Err(e) => {
                    debug!(stream_id = self.stream_id, error = %e, "websocket protocol error");
                    let code = e.close_code();
                    let close = WsOutbound::Close {
                        code,
                        reason: e.to_string(),
                    };
                    if let Ok(data) = connection.send(close) {
                        effects.push(data_frame(self.stream_id, data));
                    }
                    self.close_code = Some(code);
                    self.state = WsStreamState::Closed;
                    effects.extend(self.end());
                    return effects;
                }
            }
        }
    }

    pub(crate) fn on_app(&mut self, message: Option<OutboundMessage>) -> Result<Vec<Effect>, SendError> {
        let Some(message) = message else {
            return Ok(self.on_app_finished());
        };
        let state = self.state;
        let kind = message.kind();
        let effects = match message {
            OutboundMessage::WebsocketAccept { subprotocol, headers } if state == WsStreamState::Handshake => {
                let accepted = self.handshake.accept(subprotocol.as_deref(), &headers)?;
                self.state = WsStreamState::Connected;
                let mut connection = WsConnection::new(accepted.deflate, self.max_message_size);
                connection.receive_data(&self.pending.split());
                self.connection = Some(connection);

                let mut effects = vec![
                    Effect::Emit(ProtocolEvent::Response {
                        stream_id: self.stream_id,
                        headers: accepted.headers,
                        status_code: accepted.status,
                    }),
                    self.access_log(accepted.status),
                ];
                if self.heartbeat {
                    effects.push(Effect::StartHeartbeat);
                }
                effects.extend(self.drain());
                effects
            }
            OutboundMessage::WebsocketHttpResponseStart { status, headers } if state == WsStreamState::Handshake => {
                if !(200..=999).contains(&status) {
                    return Err(SendError::InvalidStatus(status));
                }
                self.response = Some((StatusCode(status), build_and_validate_headers(&headers)?));
                Vec::new()
            }
            OutboundMessage::WebsocketHttpResponseBody { body, more_body }
                if matches!(state, WsStreamState::Handshake | WsStreamState::Response) && self.response.is_some() =>
            {
                self.rejection_body(body, more_body)
            }
            OutboundMessage::WebsocketSend(message) if state == WsStreamState::Connected => {
                let Some(connection) = self.connection.as_mut() else {
                    return Err(SendError::UnexpectedMessage { state: state.name(), message: kind });
                };
                match connection.send(WsOutbound::Message(message)) {
                    Ok(data) => vec![data_frame(self.stream_id, data)],
                    Err(_) => return Err(SendError::UnexpectedMessage { state: "CLOSING", message: kind }),
                }
            }
            OutboundMessage::WebsocketClose { .. } if state == WsStreamState::Handshake => {
                self.http_error(StatusCode::FORBIDDEN)
            }
            OutboundMessage::WebsocketClose { code, reason } if state == WsStreamState::Connected => {
                let mut effects = Vec::with_capacity(2);
                if let Some(connection) = self.connection.as_mut() {
                    let close = WsOutbound::Close {
                        code,
                        reason: reason.unwrap_or_default(),
                    };
                    if let Ok(data) = connection.send(close) {
                        effects.push(data_frame(self.stream_id, data));
                    }
                }
                self.state = WsStreamState::Closed;
                effects.push(Effect::Emit(ProtocolEvent::EndData {
                    stream_id: self.stream_id,
                }));
                effects
            }
            _ => return Err(SendError::UnexpectedMessage { state: state.name(), message: kind }),
        };
        if self.closed {
            return Ok(Vec::new());
        }
        Ok(effects)
    }

    fn rejection_body(&mut self, body: Bytes, more_body: bool) -> Vec<Effect> {
        let Some((status, headers)) = self.response.clone() else {
            return Vec::new();
        };
        let mut effects = Vec::with_capacity(4);
        if self.state == WsStreamState::Handshake {
            effects.push(Effect::Emit(ProtocolEvent::Response {
                stream_id: self.stream_id,
                headers,
                status_code: status,
            }));
            self.state = WsStreamState::Response;
        }
        if !body.is_empty() && !suppress_body(&Method::Get, status) {
            effects.push(Effect::Emit(ProtocolEvent::Body {
                stream_id: self.stream_id,
                data: body,
            }));
        }
        if !more_body {
            effects.push(Effect::Emit(ProtocolEvent::EndBody {
                stream_id: self.stream_id,
            }));
            self.state = WsStreamState::HttpClosed;
            effects.push(self.access_log(status));
        }
        effects
    }

    fn on_app_finished(&mut self) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        let mut effects = match self.state {
            WsStreamState::Handshake => self.http_error(StatusCode::INTERNAL_SERVER_ERROR),
            WsStreamState::Connected => {
                let close = WsOutbound::Close {
                    code: close_code::INTERNAL_ERROR,
                    reason: String::new(),
                };
                let frame = self.connection.as_mut().and_then(|c| c.send(close).ok());
                self.state = WsStreamState::Closed;
                frame.map(|data| data_frame(self.stream_id, data)).into_iter().collect()
            }
            _ => Vec::new(),
        };
        effects.extend(self.end());
        effects
    }

    /// A heartbeat ping, or `None` once the session is over.
    fn ping(&mut self) -> Option<Vec<Effect>> {
        if self.closed || self.state != WsStreamState::Connected {
            return None;
        }
        let data = self.connection.as_mut()?.send(WsOutbound::Ping(Bytes::new())).ok()?;
        Some(vec![data_frame(self.stream_id, data)])
    }
}

fn data_frame(stream_id: u32, data: Bytes) -> Effect {
    Effect::Emit(ProtocolEvent::Data { stream_id, data })
}

/// Handler for one WebSocket session.
pub struct WsStream {
    core: StreamCore,
    machine: Mutex<WsMachine>,
    config: Arc<Config>,
    this: Weak<WsStream>,
}

impl WsStream {
    pub(crate) fn new(ctx: &ProtocolContext, protocol: Weak<dyn StreamSink>, stream_id: u32) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let sink: Weak<dyn MessageSink> = this.clone();
            Self {
                core: StreamCore::new(ctx, protocol, sink, stream_id),
                machine: Mutex::new(WsMachine::new(stream_id, Peers::from(ctx), &ctx.config)),
                config: Arc::clone(&ctx.config),
                this: this.clone(),
            }
        })
    }

    fn machine(&self) -> MutexGuard<'_, WsMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> WsStreamState {
        self.machine().state()
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state(), WsStreamState::Closed | WsStreamState::HttpClosed)
    }

    pub(crate) async fn handle(&self, event: ProtocolEvent) {
        let effects = self.machine().on_event(event, &self.config);
        self.run(effects).await;
    }

    async fn run(&self, mut effects: Vec<Effect>) {
        if let Some(pos) = effects.iter().position(|e| *e == Effect::StartHeartbeat) {
            effects.remove(pos);
            self.start_heartbeat();
        }
        self.core.execute(effects).await;
    }

    fn start_heartbeat(&self) {
        let Some(period) = self.config.websocket_ping_interval().filter(|p| !p.is_zero()) else {
            return;
        };
        let this = self.this.clone();
        self.core.spawner.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(stream) = this.upgrade() else {
                    break;
                };
                let Some(effects) = stream.machine().ping() else {
                    break;
                };
                stream.core.execute(effects).await;
            }
        });
    }
}

impl MessageSink for WsStream {
    fn app_send(&self, message: Option<OutboundMessage>) -> BoxFuture<'_, Result<(), SendError>> {
        Box::pin(async move {
            let effects = self.machine().on_app(message)?;
            self.run(effects).await;
            Ok(())
        })
    }
}
