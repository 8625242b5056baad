//! TCP listener serving PTY streams

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use sandboxd_utils::{Result, SandboxError};

use crate::pty::PtyManager;
use crate::stream::serve_pty_connection;

/// Bind the stream listener
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| SandboxError::connection(format!("Failed to bind {}: {}", addr, e)))
}

/// Accept connections until a shutdown signal arrives
pub async fn run_tcp_accept_loop(
    listener: TcpListener,
    ptys: Arc<PtyManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?local, "TCP listener ready");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "New TCP connection");
                        let _ = stream.set_nodelay(true);
                        let ptys = Arc::clone(&ptys);
                        tokio::spawn(async move {
                            if let Err(e) = serve_pty_connection(stream, &ptys).await {
                                warn!(peer = %peer_addr, error = %e, "PTY stream ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping TCP accept loop");
                break;
            }
        }
    }
}
