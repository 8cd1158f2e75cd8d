//! HTTP request/response stream handler.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;

use super::{Effect, Peers, RequestTarget, StreamCore, error_response, valid_server_name};
use crate::app::{HttpExtensions, HttpScope, InboundMessage, MessageSink, OutboundMessage, Scope, SendError};
use crate::config::Config;
use crate::events::{InformationalStatus, ProtocolEvent};
use crate::http::headers::build_and_validate_headers;
use crate::http::{Headers, HttpVersion, Method, StatusCode, suppress_body};
use crate::protocol::{ProtocolContext, StreamSink};

/// Lifecycle of one exchange. The response head is held back until the first
/// body message, so a response only reaches the wire once the application
/// has committed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    Request,
    Response,
    Trailers,
    Closed,
}

impl HttpState {
    fn name(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Trailers => "TRAILERS",
            Self::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone)]
struct ResponseStart {
    status: StatusCode,
    headers: Headers,
    trailers: bool,
}

/// Pure transition logic for [`HttpStream`].
#[derive(Debug)]
pub(crate) struct HttpMachine {
    stream_id: u32,
    peers: Peers,
    state: HttpState,
    /// The stream is gone; inputs are ignored.
    closed: bool,
    scope: Option<HttpScope>,
    response: Option<ResponseStart>,
    trailers: Headers,
}

impl HttpMachine {
    pub(crate) fn new(stream_id: u32, peers: Peers) -> Self {
        Self {
            stream_id,
            peers,
            state: HttpState::Request,
            closed: false,
            scope: None,
            response: None,
            trailers: Headers::new(),
        }
    }

    pub(crate) fn state(&self) -> HttpState {
        self.state
    }

    fn method(&self) -> Method {
        self.scope.as_ref().map_or(Method::Get, |s| s.method.clone())
    }

    fn access_log(&self, status: Option<u16>) -> Effect {
        Effect::AccessLog {
            method: self.method(),
            path: self.scope.as_ref().map(|s| s.path.clone()).unwrap_or_default(),
            status,
        }
    }

    fn version(&self) -> HttpVersion {
        self.scope.as_ref().map_or(HttpVersion::Http11, |s| s.http_version)
    }

    /// Answers on the application's behalf and closes the exchange.
    fn fail(&mut self, status: StatusCode) -> Vec<Effect> {
        self.state = HttpState::Closed;
        let mut effects: Vec<Effect> = error_response(self.stream_id, status)
            .into_iter()
            .map(Effect::Emit)
            .collect();
        effects.push(self.access_log(Some(status.as_u16())));
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
                method,
                raw_path,
                ..
            } => {
                let target = RequestTarget::parse(&raw_path);
                let extensions = if http_version.supports_extensions() {
                    HttpExtensions {
                        http_response_push: true,
                        http_response_early_hint: true,
                        http_response_trailers: true,
                    }
                } else {
                    HttpExtensions::default()
                };
                let valid_host = valid_server_name(config, &headers);
                let scope = HttpScope {
                    http_version,
                    method,
                    scheme: "http",
                    path: target.path,
                    raw_path: target.raw_path,
                    query_string: target.query_string,
                    headers,
                    client: self.peers.client,
                    server: self.peers.server,
                    extensions,
                };
                self.scope = Some(scope.clone());

                if valid_host {
                    vec![Effect::SpawnApp(Scope::Http(scope))]
                } else {
                    self.closed = true;
                    let mut effects = self.fail(StatusCode::NOT_FOUND);
                    effects.push(Effect::Emit(ProtocolEvent::StreamClosed {
                        stream_id: self.stream_id,
                    }));
                    effects
                }
            }
            ProtocolEvent::Body { data, .. } => vec![Effect::Deliver(InboundMessage::HttpRequest {
                body: data,
                more_body: true,
            })],
            ProtocolEvent::EndBody { .. } => vec![Effect::Deliver(InboundMessage::HttpRequest {
                body: Bytes::new(),
                more_body: false,
            })],
            ProtocolEvent::StreamClosed { .. } => {
                self.closed = true;
                let mut effects = Vec::with_capacity(2);
                if self.state != HttpState::Closed {
                    effects.push(self.access_log(None));
                }
                effects.push(Effect::Disconnect(InboundMessage::HttpDisconnect));
                effects
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn on_app(&mut self, message: Option<OutboundMessage>) -> Result<Vec<Effect>, SendError> {
        let Some(message) = message else {
            return Ok(self.on_app_finished());
        };
        let state = self.state;
        let effects = match message {
            OutboundMessage::HttpResponseStart {
                status,
                headers,
                trailers,
            } if state == HttpState::Request && self.response.is_none() => {
                if !(200..=999).contains(&status) {
                    return Err(SendError::InvalidStatus(status));
                }
                self.response = Some(ResponseStart {
                    status: StatusCode(status),
                    headers: build_and_validate_headers(&headers)?,
                    trailers,
                });
                Vec::new()
            }
            OutboundMessage::HttpResponsePush { .. } if !self.version().supports_extensions() => Vec::new(),
            OutboundMessage::HttpResponsePush { path, headers } if state == HttpState::Request => {
                self.push_promise(path, &headers)?
            }
            OutboundMessage::HttpResponseEarlyHint { .. } if !self.version().supports_extensions() => Vec::new(),
            OutboundMessage::HttpResponseEarlyHint { links } if state == HttpState::Request => {
                let headers: Headers = links.iter().map(|link| ("link", link.trim())).collect();
                let status_code = InformationalStatus::try_from(StatusCode::EARLY_HINTS)
                    .map_err(|e| SendError::InvalidStatus(e.0))?;
                vec![Effect::Emit(ProtocolEvent::InformationalResponse {
                    stream_id: self.stream_id,
                    headers,
                    status_code,
                })]
            }
            OutboundMessage::HttpResponseBody { body, more_body }
                if matches!(state, HttpState::Request | HttpState::Response) && self.response.is_some() =>
            {
                self.body(body, more_body)
            }
            OutboundMessage::HttpResponseTrailers {
                headers,
                more_trailers,
            } if state == HttpState::Trailers => {
                self.trailers.extend(build_and_validate_headers(&headers)?);
                if more_trailers {
                    Vec::new()
                } else {
                    self.finish_trailers()
                }
            }
            other => return Err(SendError::unexpected(state.name(), &other)),
        };
        if self.closed {
            return Ok(Vec::new());
        }
        Ok(effects)
    }

    fn push_promise(&self, path: String, headers: &Headers) -> Result<Vec<Effect>, SendError> {
        let Some(scope) = &self.scope else {
            return Ok(Vec::new());
        };
        let mut promised = Headers::new();
        promised.insert(":scheme", scope.scheme);
        if let Some(host) = scope.headers.get("host") {
            promised.insert(":authority", host);
        }
        promised.extend(build_and_validate_headers(headers)?);
        Ok(vec![Effect::Emit(ProtocolEvent::Request {
            stream_id: self.stream_id,
            headers: promised,
            http_version: scope.http_version,
            method: Method::Get,
            raw_path: path,
        })])
    }

    fn body(&mut self, body: Bytes, more_body: bool) -> Vec<Effect> {
        let Some(response) = self.response.clone() else {
            return Vec::new();
        };
        let mut effects = Vec::with_capacity(4);
        if self.state == HttpState::Request {
            effects.push(Effect::Emit(ProtocolEvent::Response {
                stream_id: self.stream_id,
                headers: response.headers,
                status_code: response.status,
            }));
            self.state = HttpState::Response;
        }
        if !body.is_empty() && !suppress_body(&self.method(), response.status) {
            effects.push(Effect::Emit(ProtocolEvent::Body {
                stream_id: self.stream_id,
                data: body,
            }));
        }
        if !more_body {
            if response.trailers && self.version().supports_extensions() {
                self.state = HttpState::Trailers;
            } else {
                effects.extend(self.complete(ProtocolEvent::EndBody {
                    stream_id: self.stream_id,
                }));
            }
        }
        effects
    }

    /// Trailers only reach the wire when the client said it accepts them.
    fn finish_trailers(&mut self) -> Vec<Effect> {
        let accepts_trailers = self
            .scope
            .as_ref()
            .is_some_and(|s| s.headers.has_token("te", "trailers"));
        let last = if accepts_trailers {
            ProtocolEvent::Trailers {
                stream_id: self.stream_id,
                headers: std::mem::take(&mut self.trailers),
            }
        } else {
            ProtocolEvent::EndBody {
                stream_id: self.stream_id,
            }
        };
        self.complete(last)
    }

    fn complete(&mut self, last: ProtocolEvent) -> Vec<Effect> {
        self.state = HttpState::Closed;
        let status = self.response.as_ref().map(|r| r.status.as_u16());
        vec![
            Effect::Emit(last),
            self.access_log(status),
            Effect::Emit(ProtocolEvent::StreamClosed {
                stream_id: self.stream_id,
            }),
        ]
    }

    fn on_app_finished(&mut self) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        let mut effects = match self.state {
            HttpState::Request => self.fail(StatusCode::INTERNAL_SERVER_ERROR),
            HttpState::Trailers => {
                self.state = HttpState::Closed;
                let status = self.response.as_ref().map(|r| r.status.as_u16());
                vec![
                    Effect::Emit(ProtocolEvent::EndBody {
                        stream_id: self.stream_id,
                    }),
                    self.access_log(status),
                ]
            }
            HttpState::Response => Vec::new(),
            // Completion already closed the stream.
            HttpState::Closed => return Vec::new(),
        };
        effects.push(Effect::Emit(ProtocolEvent::StreamClosed {
            stream_id: self.stream_id,
        }));
        effects
    }
}

/// Handler for a plain HTTP exchange on any protocol.
pub struct HttpStream {
    core: StreamCore,
    machine: Mutex<HttpMachine>,
    config: Arc<Config>,
}

impl HttpStream {
    pub(crate) fn new(ctx: &ProtocolContext, protocol: Weak<dyn StreamSink>, stream_id: u32) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let sink: Weak<dyn MessageSink> = this.clone();
            Self {
                core: StreamCore::new(ctx, protocol, sink, stream_id),
                machine: Mutex::new(HttpMachine::new(stream_id, Peers::from(ctx))),
                config: Arc::clone(&ctx.config),
            }
        })
    }

    fn machine(&self) -> MutexGuard<'_, HttpMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> HttpState {
        self.machine().state()
    }

    pub(crate) async fn handle(&self, event: ProtocolEvent) {
        let effects = self.machine().on_event(event, &self.config);
        self.core.execute(effects).await;
    }
}

impl MessageSink for HttpStream {
    fn app_send(&self, message: Option<OutboundMessage>) -> BoxFuture<'_, Result<(), SendError>> {
        Box::pin(async move {
            let effects = self.machine().on_app(message)?;
            self.core.execute(effects).await;
            Ok(())
        })
    }
}
