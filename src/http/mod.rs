//! HTTP front door (C6): a hyper/1 listener wiring admission, dispatch, and
//! accounting together, plus the metrics/health listener.

mod health;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::AppState;

/// Serves the public generation + operator routes until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "gateway HTTP listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = state.clone();
                let conn_shutdown = shutdown.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { routes::route(req, peer.ip(), state).await }
                    });
                    let serve = http1::Builder::new().serve_connection(io, service);
                    tokio::select! {
                        result = serve => {
                            if let Err(e) = result {
                                debug!(error = %e, "connection error");
                            }
                        }
                        _ = conn_shutdown.cancelled() => {}
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("HTTP listener shutting down");
                return Ok(());
            }
        }
    }
}
