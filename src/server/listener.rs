use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::info;

use crate::http::connection::Connection;
use crate::server::ProxyServer;
use crate::server::shutdown::Shutdown;

/// Pause after a failed accept so that descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Binds the configured address and serves until `shutdown` resolves.
pub async fn run(server: Arc<ProxyServer>, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let listen_addr = server.config().listen_addr.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {} -> {}", listener.local_addr()?, server.target());

    serve(listener, server, shutdown).await
}

/// Accepts client connections on an already bound listener.
///
/// Once `shutdown` resolves no new connections are accepted, idle clients
/// are closed, and in-flight requests get the configured grace period to
/// finish before they are cancelled.
pub async fn serve(
    listener: TcpListener,
    server: Arc<ProxyServer>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let sweeper = server.pool().spawn_sweeper();
    let coordinator = Shutdown::new();
    let mut connections = JoinSet::new();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                tracing::debug!("Accepted connection from {}", peer);

                if let Err(e) = socket.set_nodelay(true) {
                    tracing::debug!(error = %e, "failed to set TCP_NODELAY on client socket");
                }
                let local = match socket.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "client socket lost before serving");
                        continue;
                    }
                };

                let server = server.clone();
                let signal = coordinator.subscribe();
                connections.spawn(async move {
                    let mut conn = Connection::new(socket, peer, local, server, signal);
                    if let Err(e) = conn.run().await {
                        tracing::debug!("Connection error from {}: {}", peer, e);
                    }
                });
            }

            Some(joined) = connections.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    coordinator.trigger();

    let grace = server.config().shutdown_grace();
    let in_flight = connections.len();
    if in_flight > 0 {
        info!(in_flight, grace_ms = grace.as_millis() as u64, "Draining connections");
    }

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = connections.len(), "grace period elapsed, cancelling connections");
        connections.shutdown().await;
    }

    sweeper.abort();
    info!("Proxy stopped");
    Ok(())
}
