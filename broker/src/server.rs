//! HTTP server lifecycle.
//!
//! Serves axum routers either over plain TCP or over accepted tunnel
//! connections (HTTP/1.1 and h2c via the hyper auto builder), with graceful
//! shutdown bounded by a deadline.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tower::ServiceExt;
use tracing::{debug, warn};

use broker_shared::{Error, Result};

use crate::netstack::{VirtualListener, VirtualStream};

/// A running HTTP server. `stop` shuts it down gracefully; in-flight
/// requests get until the deadline, then the task is aborted.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    graceful: Duration,
}

impl ServerHandle {
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(self.graceful, &mut self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Server(format!("server task failed: {e}"))),
            Err(_) => {
                self.task.abort();
                Err(Error::Timeout)
            }
        }
    }
}

/// Serve `app` over connections accepted from the tunnel listener.
pub fn serve_virtual(mut listener: VirtualListener, app: Router, graceful: Duration) -> ServerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => {
                    let Some((stream, peer)) = accepted else { break };
                    let app = app.clone();
                    inflight.spawn(serve_connection(stream, peer, app));
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }
        // Listener closed; let in-flight requests complete naturally. The
        // stop deadline bounds how long this is allowed to take.
        while inflight.join_next().await.is_some() {}
    });

    ServerHandle {
        shutdown: shutdown_tx,
        task,
        graceful,
    }
}

async fn serve_connection(stream: VirtualStream, peer: SocketAddr, app: Router) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let app = app.clone();
        async move {
            let (parts, body) = req.into_parts();
            let req = Request::from_parts(parts, Body::new(body));
            let response = app.oneshot(req).await.unwrap_or_else(|err| match err {});
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        debug!(peer = %peer, error = %e, "server.connection_error");
    }
}

/// Serve `app` on a plain TCP listener.
pub fn serve_tcp(listener: tokio::net::TcpListener, app: Router, graceful: Duration) -> ServerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "server.error");
        }
    });

    ServerHandle {
        shutdown: shutdown_tx,
        task,
        graceful,
    }
}
