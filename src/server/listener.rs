//! The accept loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{Server, ServerError};
use crate::app::SharedApp;
use crate::background::Event;
use crate::config::Config;
use crate::context::WorkerContext;

/// Pause after `accept()` fails for lack of resources.
const CAPACITY_BACKOFF: Duration = Duration::from_millis(100);

/// `accept()` failed because the process or system ran out of resources.
/// Connections close over time, so retrying later can succeed.
fn is_capacity_error(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOMEM | libc::ENOBUFS)
    )
}

/// The failure concerned one connection only.
fn is_connection_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

/// Accepts connections on `listener` until `shutdown` is set, then waits up
/// to the graceful timeout for live connections and aborts the rest.
///
/// # Errors
///
/// [`ServerError::Accept`] for an accept failure that is neither a capacity
/// error nor specific to one connection. Live connections are drained first.
pub async fn serve_listener(
    listener: TcpListener,
    app: SharedApp,
    config: Arc<Config>,
    context: Arc<WorkerContext>,
    shutdown: Arc<Event>,
) -> Result<(), ServerError> {
    let local = listener.local_addr().ok();
    if let Some(address) = local {
        info!(%address, "muxserve listening");
    }

    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            () = shutdown.wait() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let _ = stream.set_nodelay(true);
                    let server = Server::new(Arc::clone(&app), Arc::clone(&config), Arc::clone(&context), stream)
                        .with_peers(Some(peer), local);
                    connections.spawn(server.serve());
                }
                Err(e) if is_capacity_error(&e) => {
                    warn!(error = %e, "out of resources accepting connections; backing off");
                    tokio::time::sleep(CAPACITY_BACKOFF).await;
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "connection failed during accept");
                }
                Err(e) => break Err(ServerError::Accept(e)),
            },
            // Reap finished connections so the set does not grow without bound.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };
    drop(listener);

    let drained = tokio::time::timeout(config.graceful_timeout(), async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "graceful timeout elapsed; aborting connections");
        connections.shutdown().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_classified() {
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOMEM, libc::ENOBUFS] {
            assert!(is_capacity_error(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_capacity_error(&io::Error::from_raw_os_error(libc::EINVAL)));
        assert!(!is_capacity_error(&io::Error::other("boom")));
    }

    #[test]
    fn connection_errors_are_retried() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_connection_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn stops_accepting_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let shutdown = Arc::new(Event::new());
        let app = crate::protocol::tests::ok_app();
        let task = tokio::spawn(serve_listener(
            listener,
            app,
            Arc::new(Config::default()),
            Arc::new(WorkerContext::default()),
            Arc::clone(&shutdown),
        ));

        tokio::net::TcpStream::connect(address).await.unwrap();
        shutdown.set();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(tokio::net::TcpStream::connect(address).await.is_err());
    }
}
