//! HTTP/1.1 engine.
//!
//! Drives an [`H11Connection`] with bytes from the connection and serves one
//! request at a time on stream `1`. Pipelined requests wait until the current
//! exchange recycles the connection.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::{HandleOutcome, ProtocolContext, StreamSink, Switch};
use crate::background::Event;
use crate::events::{ProtocolEvent, ServerEvent};
use crate::http::connection::{H2_PREFACE_HEAD, RequestHeadEvent};
use crate::http::headers::response_headers;
use crate::http::{H11Connection, H11Error, H11Event, H11Outbound, H11State, Headers, Method, StatusCode};
use crate::streams::{HttpStream, StreamHandler, WsStream};

const STREAM_ID: u32 = 1;

struct H11Inner {
    conn: H11Connection,
    keep_alive_requests: u64,
}

pub struct H11Protocol {
    ctx: ProtocolContext,
    this: Weak<H11Protocol>,
    /// Held across socket writes so bytes leave in the order they were made.
    inner: AsyncMutex<H11Inner>,
    stream: Mutex<Option<StreamHandler>>,
    can_read: Event,
}

impl H11Protocol {
    pub(crate) fn new(ctx: &ProtocolContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx: ctx.clone(),
            this: this.clone(),
            inner: AsyncMutex::new(H11Inner {
                conn: H11Connection::new(ctx.config.h11_max_incomplete_size),
                keep_alive_requests: 0,
            }),
            stream: Mutex::new(None),
            can_read: Event::new(),
        })
    }

    fn stream(&self) -> MutexGuard<'_, Option<StreamHandler>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_stream(&self) -> Option<StreamHandler> {
        self.stream().clone()
    }

    pub(crate) async fn handle(&self, event: ServerEvent) -> HandleOutcome {
        match event {
            ServerEvent::RawData { data, .. } => {
                self.inner.lock().await.conn.receive_data(&data);
                self.handle_events().await
            }
            ServerEvent::Closed => {
                self.close_stream().await;
                HandleOutcome::Continue
            }
            ServerEvent::Updated { .. } => HandleOutcome::Continue,
        }
    }

    async fn handle_events(&self) -> HandleOutcome {
        loop {
            let next = {
                let mut inner = self.inner.lock().await;
                if inner.conn.they_are_waiting_for_100_continue() {
                    let continue_ = H11Outbound::Informational {
                        status: StatusCode::CONTINUE,
                        headers: response_headers(&self.ctx.config, "h11"),
                    };
                    self.write(&mut inner, continue_).await;
                }
                let next = inner.conn.next_event();
                if let Ok(H11Event::Paused) = next {
                    // Cleared under the lock so a concurrent recycle cannot be missed.
                    self.can_read.clear();
                }
                next
            };

            let event = match next {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "http/1.1 protocol error");
                    let status = match e {
                        H11Error::Remote { status, .. } => status,
                        H11Error::Local(_) => 400,
                    };
                    let mut inner = self.inner.lock().await;
                    if matches!(inner.conn.our_state(), H11State::Idle | H11State::SendResponse) {
                        self.send_error_response(&mut inner, StatusCode(status)).await;
                    }
                    drop(inner);
                    self.ctx.send(ServerEvent::Closed).await;
                    return HandleOutcome::Continue;
                }
            };

            match event {
                H11Event::Request(request) => {
                    self.ctx.send(ServerEvent::Updated { idle: false }).await;
                    if let Some(switch) = self.check_protocol(&request).await {
                        return HandleOutcome::SwitchProtocol(switch);
                    }
                    self.create_stream(request).await;
                }
                H11Event::Http2Preface => {
                    let trailing = self.inner.lock().await.conn.take_trailing_data();
                    let mut pending = BytesMut::with_capacity(H2_PREFACE_HEAD.len() + trailing.len());
                    pending.extend_from_slice(H2_PREFACE_HEAD);
                    pending.extend_from_slice(&trailing);
                    return HandleOutcome::SwitchProtocol(Switch::H2 {
                        pending: pending.freeze(),
                    });
                }
                H11Event::Paused => {
                    tokio::select! {
                        () = self.can_read.wait() => {}
                        () = self.ctx.closing.wait() => return HandleOutcome::Continue,
                    }
                }
                H11Event::NeedData | H11Event::ConnectionClosed => return HandleOutcome::Continue,
                H11Event::Data(data) => {
                    let Some(stream) = self.current_stream() else {
                        return HandleOutcome::Continue;
                    };
                    stream
                        .handle(ProtocolEvent::Body {
                            stream_id: STREAM_ID,
                            data,
                        })
                        .await;
                }
                H11Event::EndOfMessage => {
                    let Some(stream) = self.current_stream() else {
                        return HandleOutcome::Continue;
                    };
                    stream.handle(ProtocolEvent::EndBody { stream_id: STREAM_ID }).await;
                }
                H11Event::Passthrough(data) => {
                    let Some(stream) = self.current_stream() else {
                        return HandleOutcome::Continue;
                    };
                    stream
                        .handle(ProtocolEvent::Data {
                            stream_id: STREAM_ID,
                            data,
                        })
                        .await;
                }
            }
        }
    }

    /// Detects `Upgrade: h2c`. Requests with a body stay on HTTP/1.1, since
    /// the body would have to be read in full before switching.
    async fn check_protocol(&self, request: &RequestHeadEvent) -> Option<Switch> {
        let wants_h2c = request
            .headers
            .get("upgrade")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("h2c"));
        let has_body = request.headers.contains("content-length") || request.headers.contains("transfer-encoding");
        if !wants_h2c || has_body {
            return None;
        }

        let mut settings = String::new();
        let mut headers = Headers::with_capacity(request.headers.len() + 3);
        headers.insert(":method", request.method.as_str());
        headers.insert(":path", request.target.as_str());
        if let Some(host) = request.headers.get("host") {
            headers.insert(":authority", host);
        }
        for (name, value) in request.headers.iter() {
            if name.eq_ignore_ascii_case("http2-settings") {
                settings = value.trim().to_owned();
            }
            headers.insert(name, value);
        }

        let mut inner = self.inner.lock().await;
        let mut switching = response_headers(&self.ctx.config, "h11");
        switching.insert("connection", "upgrade");
        switching.insert("upgrade", "h2c");
        self.write(
            &mut inner,
            H11Outbound::Informational {
                status: StatusCode::SWITCHING_PROTOCOLS,
                headers: switching,
            },
        )
        .await;
        Some(Switch::H2c {
            pending: inner.conn.take_trailing_data(),
            headers,
            settings,
        })
    }

    async fn create_stream(&self, request: RequestHeadEvent) {
        let websocket = request.method == Method::Get
            && request.headers.has_token("connection", "upgrade")
            && request
                .headers
                .get("upgrade")
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));

        let protocol: Weak<dyn StreamSink> = self.this.clone();
        let handler = if websocket {
            self.inner.lock().await.conn.switch_to_passthrough();
            StreamHandler::Ws(WsStream::new(&self.ctx, protocol, STREAM_ID))
        } else {
            StreamHandler::Http(HttpStream::new(&self.ctx, protocol, STREAM_ID))
        };
        *self.stream() = Some(handler.clone());

        self.inner.lock().await.keep_alive_requests += 1;
        self.ctx.context.mark_request();

        handler
            .handle(ProtocolEvent::Request {
                stream_id: STREAM_ID,
                headers: request.headers,
                http_version: request.version,
                method: request.method,
                raw_path: request.target,
            })
            .await;
    }

    /// Serializes `event` and writes it. Local errors after the peer already
    /// broke the protocol are expected and dropped.
    async fn write(&self, inner: &mut H11Inner, event: H11Outbound) -> bool {
        match inner.conn.send(event) {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    self.ctx.send(ServerEvent::raw(bytes)).await;
                }
                true
            }
            Err(e) => {
                if inner.conn.their_state() != H11State::Error {
                    warn!(error = %e, "http/1.1 send failed; closing connection");
                    self.ctx.send(ServerEvent::Closed).await;
                }
                false
            }
        }
    }

    async fn send_error_response(&self, inner: &mut H11Inner, status: StatusCode) {
        let mut headers: Headers = [("content-length", "0"), ("connection", "close")].into_iter().collect();
        headers.extend(response_headers(&self.ctx.config, "h11"));
        if self.write(inner, H11Outbound::Response { status, headers }).await {
            self.write(inner, H11Outbound::EndOfMessage).await;
        }
    }

    async fn close_stream(&self) {
        let stream = self.stream().take();
        if let Some(stream) = stream {
            stream.handle(ProtocolEvent::StreamClosed { stream_id: STREAM_ID }).await;
        }
    }

    /// Restarts the connection for the next request when both sides finished
    /// cleanly; closes it otherwise.
    async fn maybe_recycle(&self) {
        self.close_stream().await;

        let mut inner = self.inner.lock().await;
        let reusable = !self.ctx.context.terminated().is_set()
            && inner.conn.our_state() == H11State::Done
            && inner.conn.their_state() == H11State::Done;
        if reusable && inner.conn.start_next_cycle().is_ok() {
            self.can_read.set();
            drop(inner);
            self.ctx.send(ServerEvent::Updated { idle: true }).await;
        } else {
            self.can_read.set();
            drop(inner);
            self.ctx.send(ServerEvent::Closed).await;
        }
    }

    async fn send_stream_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Response {
                mut headers,
                status_code,
                ..
            } => {
                headers.extend(response_headers(&self.ctx.config, "h11"));
                let mut inner = self.inner.lock().await;
                let outbound = if status_code.as_u16() >= 200 {
                    if inner.keep_alive_requests >= self.ctx.config.keep_alive_max_requests {
                        headers.insert("connection", "close");
                    }
                    H11Outbound::Response {
                        status: status_code,
                        headers,
                    }
                } else {
                    H11Outbound::Informational {
                        status: status_code,
                        headers,
                    }
                };
                self.write(&mut inner, outbound).await;
            }
            ProtocolEvent::Body { data, .. } => {
                let mut inner = self.inner.lock().await;
                self.write(&mut inner, H11Outbound::Data(data)).await;
            }
            ProtocolEvent::EndBody { .. } => {
                let mut inner = self.inner.lock().await;
                self.write(&mut inner, H11Outbound::EndOfMessage).await;
            }
            ProtocolEvent::Data { data, .. } => {
                let _inner = self.inner.lock().await;
                self.ctx.send(ServerEvent::raw(data)).await;
            }
            ProtocolEvent::StreamClosed { .. } => self.maybe_recycle().await,
            // Early hints, trailers and pushes have no HTTP/1.1 form.
            ProtocolEvent::InformationalResponse { .. }
            | ProtocolEvent::Trailers { .. }
            | ProtocolEvent::Request { .. }
            | ProtocolEvent::EndData { .. } => {}
        }
    }
}

impl StreamSink for H11Protocol {
    fn stream_send(&self, event: ProtocolEvent) -> BoxFuture<'_, ()> {
        Box::pin(self.send_stream_event(event))
    }
}

impl std::fmt::Debug for H11Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H11Protocol").finish_non_exhaustive()
    }
}
