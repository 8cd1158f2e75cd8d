//! The HTTP/2 engine.
//!
//! [`H2Protocol`] drives a sans-IO [`H2Connection`] and owns one stream
//! handler per request. Response bodies are not written directly: each
//! stream pushes into its [`StreamBuffer`] and a single send loop frames
//! the buffered bytes in priority order, within the peer's flow-control
//! windows.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::background::Event;
use crate::events::{ProtocolEvent, ServerEvent};
use crate::http::headers::{filter_pseudo_headers, response_headers};
use crate::http::{Headers, HttpVersion, Method};
use crate::streams::{HttpStream, StreamHandler, WsStream};

use super::{H2cUpgrade, ProtocolContext, StreamSink};

pub mod buffer;
pub mod connection;
pub mod error;
pub mod frame;
pub mod priority;

pub use buffer::{BufferCompleteError, StreamBuffer};
pub use connection::{H2Connection, H2Event};
pub use error::{ErrorCode, H2Error};
pub use priority::{PriorityError, PriorityTree};

/// Headers that only mean something to a single HTTP/1.1 hop.
const CONNECTION_HEADERS: [&str; 5] = ["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

struct H2Inner {
    conn: H2Connection,
    streams: HashMap<u32, StreamHandler>,
    buffers: HashMap<u32, Arc<StreamBuffer>>,
    priority: PriorityTree,
    keep_alive_requests: u64,
    closed: bool,
}

impl H2Inner {
    /// Makes the stream eligible for the send loop. Returns its buffer.
    fn ready(&mut self, stream_id: u32) -> Option<Arc<StreamBuffer>> {
        let buffer = self.buffers.get(&stream_id).cloned()?;
        let _ = self.priority.unblock(stream_id);
        Some(buffer)
    }

    /// Drops a stream's buffered data and takes it out of scheduling.
    fn discard(&mut self, stream_id: u32) {
        if let Some(buffer) = self.buffers.remove(&stream_id) {
            buffer.close();
        }
        let _ = self.priority.remove_stream(stream_id);
    }

    /// Frames the next chunk of `stream_id`'s buffer.
    fn frame_data(&mut self, stream_id: u32, buffer: &StreamBuffer) -> Result<(), H2Error> {
        let window = self.conn.local_flow_control_window(stream_id)?;
        let chunk = window.min(self.conn.max_outbound_frame_size()) as usize;
        let data = buffer.pop(chunk);
        if data.is_empty() {
            let _ = self.priority.block(stream_id);
        } else {
            self.conn.send_data(stream_id, data, false)?;
        }
        if buffer.is_complete() {
            self.conn.end_stream(stream_id)?;
            self.buffers.remove(&stream_id);
            let _ = self.priority.remove_stream(stream_id);
        }
        Ok(())
    }
}

pub struct H2Protocol {
    ctx: ProtocolContext,
    this: Weak<H2Protocol>,
    inner: AsyncMutex<H2Inner>,
    /// Set whenever a stream may have become ready to send.
    has_data: Arc<Event>,
}

impl std::fmt::Debug for H2Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Protocol")
            .field("client", &self.ctx.client)
            .finish_non_exhaustive()
    }
}

impl H2Protocol {
    pub(crate) fn new(ctx: &ProtocolContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx: ctx.clone(),
            this: this.clone(),
            inner: AsyncMutex::new(H2Inner {
                conn: H2Connection::new(&ctx.config),
                streams: HashMap::new(),
                buffers: HashMap::new(),
                priority: PriorityTree::new(),
                keep_alive_requests: 0,
                closed: false,
            }),
            has_data: Arc::new(Event::new()),
        })
    }

    /// Sends the server preface and starts the send loop. After an h2c
    /// upgrade the upgrading request becomes stream 1, already complete.
    pub(crate) async fn initiate(&self, upgrade: Option<H2cUpgrade>) {
        {
            let mut inner = self.inner.lock().await;
            match &upgrade {
                Some(upgrade) => {
                    if let Err(e) = inner.conn.initiate_upgrade_connection(&upgrade.settings) {
                        debug!(error = %e, "ignoring invalid HTTP2-Settings");
                    }
                }
                None => inner.conn.initiate_connection(),
            }
            self.flush(&mut inner).await;
        }

        self.ctx.spawner.spawn(send_loop(self.this.clone()));

        if let Some(upgrade) = upgrade {
            self.create_stream(1, upgrade.headers).await;
            self.stream_event(ProtocolEvent::EndBody { stream_id: 1 }).await;
        }
    }

    pub(crate) async fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::RawData { data, .. } => {
                let result = {
                    let mut inner = self.inner.lock().await;
                    let result = inner.conn.receive_data(&data);
                    self.flush(&mut inner).await;
                    result
                };
                match result {
                    Ok(events) => self.handle_events(events).await,
                    Err(_) => self.ctx.send(ServerEvent::Closed).await,
                }
            }
            ServerEvent::Closed => self.on_closed().await,
            ServerEvent::Updated { .. } => {}
        }
    }

    async fn handle_events(&self, events: Vec<H2Event>) {
        for event in events {
            match event {
                H2Event::RequestReceived { stream_id, headers } => self.on_request(stream_id, headers).await,
                H2Event::DataReceived {
                    stream_id,
                    data,
                    flow_controlled_length,
                } => {
                    self.stream_event(ProtocolEvent::Body { stream_id, data }).await;
                    let mut inner = self.inner.lock().await;
                    inner.conn.acknowledge_received_data(flow_controlled_length, stream_id);
                    self.flush(&mut inner).await;
                }
                H2Event::StreamEnded { stream_id } => {
                    self.stream_event(ProtocolEvent::EndBody { stream_id }).await;
                }
                H2Event::StreamReset { stream_id, .. } => {
                    self.inner.lock().await.discard(stream_id);
                    self.close_stream(stream_id).await;
                }
                H2Event::WindowUpdated { stream_id } => self.window_updated(stream_id).await,
                H2Event::PriorityUpdated {
                    stream_id,
                    depends_on,
                    weight,
                    exclusive,
                } => {
                    let mut inner = self.inner.lock().await;
                    let depends_on = Some(depends_on);
                    if let Err(PriorityError::Missing(_)) =
                        inner.priority.reprioritize(stream_id, depends_on, weight, exclusive)
                    {
                        // PRIORITY ahead of HEADERS: hold the position for
                        // the stream, blocked until it has data.
                        if inner.priority.insert_stream(stream_id, depends_on, weight, exclusive).is_ok() {
                            let _ = inner.priority.block(stream_id);
                        }
                    }
                }
                H2Event::RemoteSettingsChanged {
                    initial_window_size_changed,
                } => {
                    if initial_window_size_changed {
                        self.window_updated(0).await;
                    }
                }
                H2Event::ConnectionTerminated { code, last_stream_id } => {
                    debug!(?code, last_stream_id, "peer sent GOAWAY");
                    self.ctx.send(ServerEvent::Closed).await;
                }
            }
        }
    }

    async fn on_request(&self, stream_id: u32, headers: Headers) {
        if self.ctx.context.terminated().is_set() {
            let mut inner = self.inner.lock().await;
            inner.conn.reset_stream(stream_id, ErrorCode::RefusedStream);
            inner.conn.update_max_concurrent_streams(0);
            self.flush(&mut inner).await;
            return;
        }

        self.ctx.send(ServerEvent::Updated { idle: false }).await;
        self.create_stream(stream_id, headers).await;

        let mut inner = self.inner.lock().await;
        if inner.keep_alive_requests > self.ctx.config.keep_alive_max_requests {
            inner.conn.close_connection(ErrorCode::NoError);
            self.flush(&mut inner).await;
        }
    }

    async fn create_stream(&self, stream_id: u32, headers: Headers) {
        let method = Method::from(headers.get(":method").unwrap_or("GET"));
        let raw_path = headers.get(":path").unwrap_or("/").to_owned();

        let protocol: Weak<dyn StreamSink> = self.this.clone();
        let handler = if method == Method::Connect {
            StreamHandler::Ws(WsStream::new(&self.ctx, protocol, stream_id))
        } else {
            StreamHandler::Http(HttpStream::new(&self.ctx, protocol, stream_id))
        };

        {
            let mut inner = self.inner.lock().await;
            inner.streams.insert(stream_id, handler.clone());
            inner.buffers.insert(stream_id, Arc::new(StreamBuffer::new()));
            // A PRIORITY frame may already have placed the stream.
            let _ = inner
                .priority
                .insert_stream(stream_id, None, priority::DEFAULT_WEIGHT, false);
            let _ = inner.priority.block(stream_id);
            inner.keep_alive_requests += 1;
        }
        self.ctx.context.mark_request();

        handler
            .handle(ProtocolEvent::Request {
                stream_id,
                headers: filter_pseudo_headers(&headers),
                http_version: HttpVersion::Http2,
                method,
                raw_path,
            })
            .await;
    }

    async fn stream_event(&self, event: ProtocolEvent) {
        let handler = self.inner.lock().await.streams.get(&event.stream_id()).cloned();
        if let Some(handler) = handler {
            handler.handle(event).await;
        }
    }

    async fn close_stream(&self, stream_id: u32) {
        let handler = self.inner.lock().await.streams.remove(&stream_id);
        if let Some(handler) = handler {
            handler.handle(ProtocolEvent::StreamClosed { stream_id }).await;
        }
        self.has_data.set();
    }

    /// Stream 0 means every stream.
    async fn window_updated(&self, stream_id: u32) {
        {
            let mut inner = self.inner.lock().await;
            if stream_id == 0 {
                let ids: Vec<u32> = inner.buffers.keys().copied().collect();
                for id in ids {
                    let _ = inner.priority.unblock(id);
                }
            } else {
                let _ = inner.priority.unblock(stream_id);
            }
        }
        self.has_data.set();
    }

    async fn on_closed(&self) {
        let streams: Vec<(u32, StreamHandler)> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            for buffer in inner.buffers.values() {
                buffer.close();
            }
            inner.buffers.clear();
            inner.streams.drain().collect()
        };
        self.has_data.set();
        for (stream_id, handler) in streams {
            handler.handle(ProtocolEvent::StreamClosed { stream_id }).await;
        }
    }

    async fn flush(&self, inner: &mut H2Inner) {
        let data = inner.conn.data_to_send();
        if !data.is_empty() {
            self.ctx.send(ServerEvent::raw(data)).await;
        }
    }

    /// One turn of the send loop for `stream_id`.
    async fn send_data(&self, stream_id: u32) -> Result<(), H2Error> {
        let mut inner = self.inner.lock().await;
        let Some(buffer) = inner.buffers.get(&stream_id).cloned() else {
            let _ = inner.priority.remove_stream(stream_id);
            return Ok(());
        };
        match inner.frame_data(stream_id, &buffer) {
            Ok(()) => {}
            // The stream closed while data was waiting.
            Err(H2Error::StreamClosed(_)) => inner.discard(stream_id),
            Err(err) => return Err(err),
        }
        self.flush(&mut inner).await;
        Ok(())
    }

    async fn send_head(&self, stream_id: u32, status: u16, headers: Headers, end_stream: bool) {
        let mut head = Headers::with_capacity(headers.len() + 3);
        if status != 0 {
            head.insert(":status", status.to_string());
        }
        head.extend(
            headers
                .into_iter()
                .filter(|(name, _)| !CONNECTION_HEADERS.contains(&name.as_str())),
        );
        if status >= 200 {
            head.extend(response_headers(&self.ctx.config, "h2"));
        }

        let mut inner = self.inner.lock().await;
        match inner.conn.send_headers(stream_id, &head, end_stream) {
            Ok(()) | Err(H2Error::StreamClosed(_)) => {}
            Err(err) => warn!(stream_id, error = %err, "failed to send headers"),
        }
        self.flush(&mut inner).await;
    }

    async fn server_push(&self, stream_id: u32, path: String, headers: Headers) {
        let mut promised = Headers::with_capacity(headers.len() + 4);
        promised.insert(":method", "GET");
        promised.insert(":path", path);
        promised.extend(headers);
        promised.extend(response_headers(&self.ctx.config, "h2"));

        let pushed = {
            let mut inner = self.inner.lock().await;
            let pushed = inner.conn.push_stream(stream_id, &promised);
            self.flush(&mut inner).await;
            pushed
        };
        match pushed {
            Ok(pushed_id) => {
                self.create_stream(pushed_id, promised).await;
                self.stream_event(ProtocolEvent::EndBody { stream_id: pushed_id }).await;
            }
            Err(err) => debug!(stream_id, error = %err, "server push not sent"),
        }
    }

    async fn send_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Response {
                stream_id,
                headers,
                status_code,
            } => self.send_head(stream_id, status_code.as_u16(), headers, false).await,
            ProtocolEvent::InformationalResponse {
                stream_id,
                headers,
                status_code,
            } => {
                self.send_head(stream_id, status_code.status().as_u16(), headers, false)
                    .await
            }
            ProtocolEvent::Body { stream_id, data } | ProtocolEvent::Data { stream_id, data } => {
                let pushed = {
                    let mut inner = self.inner.lock().await;
                    inner.ready(stream_id).map(|buffer| {
                        let accepted = buffer.push(data).is_ok();
                        (accepted, buffer)
                    })
                };
                let Some((accepted, buffer)) = pushed else {
                    return;
                };
                self.has_data.set();
                if accepted {
                    buffer.wait_writable().await;
                } else {
                    debug!(stream_id, "data after the stream completed");
                }
            }
            ProtocolEvent::EndBody { stream_id } | ProtocolEvent::EndData { stream_id } => {
                let buffer = {
                    let mut inner = self.inner.lock().await;
                    let buffer = inner.buffers.get(&stream_id).cloned();
                    if let Some(buffer) = &buffer {
                        buffer.set_complete();
                        let _ = inner.priority.unblock(stream_id);
                    }
                    buffer
                };
                self.has_data.set();
                if let Some(buffer) = buffer {
                    buffer.drain().await;
                }
            }
            ProtocolEvent::Trailers { stream_id, headers } => {
                let buffer = self.inner.lock().await.ready(stream_id);
                self.has_data.set();
                if let Some(buffer) = buffer {
                    buffer.drain().await;
                }
                self.inner.lock().await.discard(stream_id);
                self.send_head(stream_id, 0, headers, true).await;
            }
            ProtocolEvent::StreamClosed { stream_id } => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(buffer) = inner.ready(stream_id) {
                        buffer.set_complete();
                    }
                }
                self.close_stream(stream_id).await;

                let mut inner = self.inner.lock().await;
                let idle = inner.streams.values().all(StreamHandler::is_idle);
                if idle && self.ctx.context.terminated().is_set() {
                    inner.conn.close_connection(ErrorCode::NoError);
                    self.flush(&mut inner).await;
                }
                drop(inner);
                self.ctx.send(ServerEvent::Updated { idle }).await;
            }
            ProtocolEvent::Request {
                stream_id,
                headers,
                raw_path,
                ..
            } => self.server_push(stream_id, raw_path, headers).await,
        }
    }
}

impl StreamSink for H2Protocol {
    fn stream_send(&self, event: ProtocolEvent) -> BoxFuture<'_, ()> {
        Box::pin(self.send_event(event))
    }
}

/// Frames buffered stream data until the connection closes. Waits on
/// `has_data` whenever every stream is blocked.
async fn send_loop(protocol: Weak<H2Protocol>) {
    loop {
        let Some(this) = protocol.upgrade() else {
            return;
        };
        let next = {
            let mut inner = this.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.priority.next()
        };
        match next {
            Ok(stream_id) => {
                if let Err(err) = this.send_data(stream_id).await {
                    warn!(stream_id, error = %err, "http/2 send failed; closing connection");
                    this.ctx.send(ServerEvent::Closed).await;
                    return;
                }
            }
            Err(_) => {
                let has_data = Arc::clone(&this.has_data);
                drop(this);
                has_data.wait().await;
                has_data.clear();
            }
        }
    }
}
