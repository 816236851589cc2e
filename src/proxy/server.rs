//! Proxy server entrypoint
//!
//! Binds a listener and runs one connection task per accepted client. The
//! returned handle supports graceful teardown: stop accepting, abort
//! in-flight connections (their sockets close on drop) and wait for the
//! accept loop to finish.

use crate::error::Result;
use crate::proxy::handler::{serve_connection, ProxyHandler};
use crate::tls::TlsStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

/// Handle to a running proxy server.
pub struct ProxyServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ProxyServer {
    /// The address the listener is bound to. With port 0 this is where the
    /// OS actually placed the server.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, tears down in-flight connections and waits for the
    /// accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        info!("proxy server on {} shut down", self.local_addr);
    }
}

/// Starts a proxy server on `host:port`. `handler_builder` is invoked once
/// per accepted connection to create that connection's [`ProxyHandler`];
/// `tls_store` is shared by every connection for leaf issuance.
pub async fn start_proxy_server<H, F>(
    handler_builder: F,
    host: &str,
    port: u16,
    tls_store: Arc<TlsStore>,
) -> Result<ProxyServer>
where
    H: ProxyHandler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    info!("proxy server listening on {local_addr}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_task = tokio::spawn(accept_loop(listener, handler_builder, tls_store, shutdown_rx));

    Ok(ProxyServer {
        local_addr,
        shutdown: shutdown_tx,
        accept_task,
    })
}

async fn accept_loop<H, F>(
    listener: TcpListener,
    handler_builder: F,
    tls_store: Arc<TlsStore>,
    mut shutdown: watch::Receiver<bool>,
) where
    H: ProxyHandler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        let handler = handler_builder();
                        connections.spawn(serve_connection(handler, stream, tls_store.clone()));
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                }
            }
        }
    }
    drop(listener);
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}
