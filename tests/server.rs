//! End-to-end tests over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use muxserve::app::{AppError, InboundMessage, OutboundMessage, Receiver, Scope, Sender, SharedApp};
use muxserve::config::Config;
use muxserve::context::WorkerContext;
use muxserve::http::Headers;
use muxserve::protocol::h2::frame::{self, Frame, PREFACE};
use muxserve::protocol::h2::StreamBuffer;
use muxserve::server::{ServerError, serve_listeners};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

fn ok_app() -> SharedApp {
    Arc::new(|scope: Scope, _rx: Receiver, tx: Sender| async move {
        if let Scope::Http(_) = scope {
            tx.send(OutboundMessage::HttpResponseStart {
                status: 200,
                headers: [("content-length", "2")].into_iter().collect(),
                trailers: false,
            })
            .await?;
            tx.send(OutboundMessage::HttpResponseBody {
                body: Bytes::from_static(b"ok"),
                more_body: false,
            })
            .await?;
        }
        Ok::<(), AppError>(())
    })
}

fn config() -> Config {
    Config {
        include_date_header: false,
        include_server_header: false,
        graceful_timeout_secs: 1.0,
        ..Config::default()
    }
}

struct Running {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    async fn stop(mut self) -> Result<(), ServerError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("worker did not stop")
            .expect("worker panicked")
    }
}

async fn start(app: SharedApp, config: Config, context: Arc<WorkerContext>) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(serve_listeners(
        app,
        Arc::new(config),
        context,
        vec![listener],
        async move {
            let _ = stopped.await;
        },
    ));
    Running {
        addr,
        stop: Some(stop),
        task,
    }
}

/// Reads until `done` says the bytes so far are complete, or EOF.
async fn read_until(stream: &mut TcpStream, done: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(&received) {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("timed out reading");
    received
}

async fn read_ok(stream: &mut TcpStream) -> String {
    let bytes = read_until(stream, |b| b.ends_with(b"ok")).await;
    String::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn get_is_answered() {
    let server = start(ok_app(), config(), Arc::new(WorkerContext::default())).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let response = read_ok(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("content-length: 2\r\n"));
    assert!(response.ends_with("\r\n\r\nok"));

    drop(client);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alive_limit_closes_the_connection() {
    let config = Config {
        keep_alive_max_requests: 2,
        ..config()
    };
    let server = start(ok_app(), config, Arc::new(WorkerContext::default())).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let first = read_ok(&mut client).await.to_ascii_lowercase();
    assert!(!first.contains("connection: close"), "{first}");

    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let second = read_ok(&mut client).await.to_ascii_lowercase();
    assert!(second.contains("connection: close"), "{second}");

    let rest = read_until(&mut client, |_| false).await;
    assert!(rest.is_empty());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn idle_connections_time_out() {
    let config = Config {
        keep_alive_timeout_secs: 0.2,
        ..config()
    };
    let server = start(ok_app(), config, Arc::new(WorkerContext::default())).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    read_ok(&mut client).await;

    // EOF arrives well before the read timeout.
    let rest = read_until(&mut client, |_| false).await;
    assert!(rest.is_empty());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn h2c_upgrade_answers_on_stream_one() {
    let server = start(ok_app(), config(), Arc::new(WorkerContext::default())).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    client
        .write_all(
            b"GET /upgraded HTTP/1.1\r\nHost: x\r\nConnection: Upgrade, HTTP2-Settings\r\n\
              Upgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        )
        .await
        .unwrap();
    let mut hello = PREFACE.to_vec();
    let mut settings = BytesMut::new();
    Frame::Settings {
        ack: false,
        params: Vec::new(),
    }
    .encode(&mut settings);
    hello.extend_from_slice(&settings);
    client.write_all(&hello).await.unwrap();

    let received = read_until(&mut client, |b| {
        let Some(head_end) = b.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        decode_all(&b[head_end + 4..])
            .iter()
            .any(|f| matches!(f, Frame::Data { stream_id: 1, end_stream: true, .. }))
    })
    .await;

    let head_end = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let head = String::from_utf8_lossy(&received[..head_end]).to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 101 switching protocols"), "{head}");
    assert!(head.contains("upgrade: h2c"));

    let frames = decode_all(&received[head_end + 4..]);
    assert!(matches!(frames[0], Frame::Settings { ack: false, .. }));
    let block = frames
        .iter()
        .find_map(|f| match f {
            Frame::Headers { stream_id: 1, block, .. } => Some(block.clone()),
            _ => None,
        })
        .expect("no response headers on stream 1");
    let headers = loona_hpack::Decoder::new().decode(&block).unwrap();
    assert_eq!(headers[0], (b":status".to_vec(), b"200".to_vec()));
    let body: Vec<u8> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Data { stream_id: 1, payload, .. } => Some(payload.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(body, b"ok");

    drop(client);
    server.stop().await.unwrap();
}

fn decode_all(bytes: &[u8]) -> Vec<Frame> {
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = frame::decode(&mut buf, frame::DEFAULT_MAX_FRAME_SIZE) {
        frames.push(frame);
    }
    frames
}

/// A client-to-server WebSocket frame, masked.
fn ws_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126);
    let mask = [0x12, 0x34, 0x56, 0x78];
    let mut frame = vec![first_byte, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

#[tokio::test]
async fn oversized_websocket_message_closes_with_1009() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let app: SharedApp = Arc::new(move |scope: Scope, mut rx: Receiver, tx: Sender| {
        let seen = seen_tx.clone();
        async move {
            if let Scope::Websocket(_) = scope {
                while let Some(message) = rx.receive().await {
                    match message {
                        InboundMessage::WebsocketConnect => {
                            tx.send(OutboundMessage::WebsocketAccept {
                                subprotocol: None,
                                headers: Headers::new(),
                            })
                            .await?;
                        }
                        other => {
                            let done = matches!(other, InboundMessage::WebsocketDisconnect { .. });
                            let _ = seen.send(other);
                            if done {
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), AppError>(())
        }
    });
    let config = Config {
        websocket_max_message_size: 16,
        ..config()
    };
    let server = start(app, config, Arc::new(WorkerContext::default())).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();
    let handshake = read_until(&mut client, |b| b.windows(4).any(|w| w == b"\r\n\r\n")).await;
    let handshake = String::from_utf8(handshake).unwrap();
    assert!(handshake.starts_with("HTTP/1.1 101 "), "{handshake}");
    assert!(handshake.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // Two fragments of ten bytes: each fits, together they do not.
    let mut message = ws_frame(0x01, b"0123456789");
    message.extend(ws_frame(0x80, b"0123456789"));
    client.write_all(&message).await.unwrap();

    let close = read_until(&mut client, |b| b.len() >= 4).await;
    assert_eq!(close[0], 0x88);
    assert_eq!(u16::from_be_bytes([close[2], close[3]]), 1009);

    while let Ok(Some(message)) = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv()).await {
        assert!(
            !matches!(message, InboundMessage::WebsocketReceive(_)),
            "oversized message reached the application"
        );
        if matches!(message, InboundMessage::WebsocketDisconnect { .. }) {
            break;
        }
    }

    drop(client);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn request_budget_shuts_the_worker_down() {
    let context = Arc::new(WorkerContext::new(Some(1)));
    let server = start(ok_app(), config(), Arc::clone(&context)).await;
    let addr = server.addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let response = read_ok(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(context.terminate().is_set());

    // The worker stops on its own; no trigger needed.
    let Running { task, stop, .. } = server;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker kept running")
        .unwrap()
        .unwrap();
    drop(stop);
    assert!(context.terminated().is_set());
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stream_buffer_applies_backpressure() {
    let buffer = Arc::new(StreamBuffer::new());
    let pusher = {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            buffer
                .push(Bytes::from(vec![1u8; 40_000]))
                .expect("buffer open")
                .await;
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pusher.is_finished());

    let mut drained = 0;
    while !pusher.is_finished() {
        drained += buffer.pop(8_192).len();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    drained += buffer.pop(usize::MAX).len();
    assert_eq!(drained, 40_000);
}
