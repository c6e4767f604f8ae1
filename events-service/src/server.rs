//! HTTP/1 accept loop with a header read deadline

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use std::io;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Accept connections until `draining` is cancelled, then wait for every open
/// connection to finish the request it is serving.
///
/// Connection tasks are owned by the returned future. Dropping it, or aborting
/// the task it runs on, aborts all of them.
pub async fn serve_http(
    listener: TcpListener,
    router: Router,
    header_read_timeout: Duration,
    draining: CancellationToken,
) -> io::Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = draining.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(
                        stream,
                        router.clone(),
                        header_read_timeout,
                        draining.clone(),
                    ));
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection dropped before it was accepted");
                }
                Err(e) => return Err(e),
            },
        }
    }

    drop(listener);
    debug!(open = connections.len(), "Listener closed, waiting for open connections");
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    router: Router,
    header_read_timeout: Duration,
    draining: CancellationToken,
) {
    let peer = stream.peer_addr().ok();

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);
    let connection =
        builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(connection);

    let mut closing = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    warn!(peer = ?peer, error = %e, "HTTP connection error");
                }
                break;
            }
            _ = draining.cancelled(), if !closing => {
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_server(header_read_timeout: Duration) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let draining = CancellationToken::new();
        tokio::spawn(serve_http(listener, router, header_read_timeout, draining.clone()));
        (addr, draining)
    }

    #[tokio::test]
    async fn test_incomplete_headers_are_cut_off() {
        let (addr, _draining) = spawn_server(Duration::from_secs(1)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /api/events/movie HTTP/1.1\r\nHost: x\r\n")
            .await
            .unwrap();

        let mut received = Vec::new();
        let read = stream.read_to_end(&mut received);
        let closed = tokio::time::timeout(Duration::from_secs(5), read).await;
        assert!(closed.is_ok(), "connection stayed open past the header deadline");
    }

    #[tokio::test]
    async fn test_complete_request_is_served() {
        let (addr, _draining) = spawn_server(Duration::from_secs(1)).await;

        let response = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_drain_closes_idle_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let draining = CancellationToken::new();
        let server = tokio::spawn(serve_http(
            listener,
            router,
            Duration::from_secs(10),
            draining.clone(),
        ));

        // Opened but never sends a request
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::task::yield_now().await;
        draining.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("drain waited on an idle connection")
            .unwrap();
        assert!(result.is_ok());
    }
}
