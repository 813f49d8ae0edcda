//! Listener for sandboxed apps (TCP, NDJSON framing).
//!
//! Each connection must open with a `Hello` carrying a provisioned session
//! token. Unknown tokens are refused with a policy-violation close before any
//! RPC traffic; accepted connections run one RPC peer until they close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lambdas_rpc::{AppAway, POLICY_VIOLATION, RpcPeer, handshake};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::error::HostError;
use crate::manager::AppsManager;
use crate::rpc::HostRpc;

pub struct HostServer {
    manager: Arc<AppsManager>,
    listener: TcpListener,
    shutdown_rx: broadcast::Receiver<()>,
}

impl HostServer {
    /// Bind `config.listen_addr` and advertise the bound address to the
    /// manager for launching sandboxed apps.
    pub async fn bind(manager: Arc<AppsManager>) -> Result<Self, HostError> {
        let addr = manager.config().listen_addr.clone();
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        manager.advertise(local);
        tracing::info!(addr = %local, "listening for sandboxed apps");
        let shutdown_rx = manager.shutdown_signal();
        Ok(Self {
            manager,
            listener,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HostError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the manager shuts down.
    pub async fn run(mut self) -> Result<(), HostError> {
        let register_timeout = self.manager.config().register_timeout;
        loop {
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let manager = self.manager.clone();
                        tokio::spawn(handle_conn(stream, peer, manager, register_timeout));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = self.shutdown_rx.recv() => break,
            }
        }
        Ok(())
    }
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<AppsManager>,
    register_timeout: Duration,
) {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);

    let hello = match timeout(register_timeout, handshake::read_hello(&mut reader)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            tracing::warn!(%peer, error = %e, "bad handshake");
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, "no handshake before timeout");
            return;
        }
    };

    let Some(app) = manager.authorize(&hello.token) else {
        tracing::warn!(%peer, "rejecting unknown session token");
        let _ = handshake::reject(&mut w, POLICY_VIOLATION, "unknown session token").await;
        let _ = w.shutdown().await;
        return;
    };
    if let Err(e) = handshake::accept(&mut w).await {
        tracing::warn!(app = %app.name(), error = %e, "failed to accept connection");
        manager.disconnected(&app);
        return;
    }
    tracing::debug!(app = %app.name(), %peer, "sandboxed app connected");

    let rpc = RpcPeer::new();
    let away = AppAway::new(rpc.caller());
    let handler = Arc::new(HostRpc::new(manager.clone(), app.clone(), away));
    if let Err(e) = rpc.run(reader, w, handler).await {
        tracing::debug!(app = %app.name(), error = %e, "channel closed with error");
    }
    manager.disconnected(&app);
}
