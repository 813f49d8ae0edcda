//! One endpoint of a duplex RPC channel.
//!
//! The peer owns three tasks once running: a writer draining outbound frames,
//! a request worker serving inbound requests in arrival order, and the read
//! loop itself which routes responses to their pending callers. Responses are
//! routed inline so a handler that calls back across the channel never
//! blocks its own reply.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::RpcError;
use crate::methods::MethodSet;
use crate::wire::{Inbound, RpcMessage, RpcRequest, RpcResponse, classify, encode};

type Resolver = oneshot::Sender<Result<Value, RpcError>>;

/// Serves inbound requests for one side of the channel.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    type Method: MethodSet;

    async fn handle(&self, method: Self::Method, params: Vec<Value>) -> anyhow::Result<Value>;
}

/// Decode positional parameter `index` for `method`.
pub fn param<T: DeserializeOwned>(
    params: &[Value],
    index: usize,
    method: &str,
) -> Result<T, RpcError> {
    let raw = params.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|e| RpcError::InvalidParams {
        method: method.to_string(),
        reason: format!("param {index}: {e}"),
    })
}

/// Closes the peer and stops its tasks when `run` ends, including when the
/// `run` future is dropped before completing.
struct Teardown {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.shared.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Resolver>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Resolver>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, msg: &RpcMessage) -> Result<(), RpcError> {
        let line = encode(msg)?;
        self.outbound.send(line).map_err(|_| RpcError::Closed)
    }

    fn respond(&self, resp: RpcResponse) {
        if let Err(e) = self.send(&RpcMessage::Response(resp)) {
            tracing::debug!(error = %e, "dropping rpc response");
        }
    }

    fn resolve(&self, resp: RpcResponse) {
        let Some(resolver) = self.pending().remove(&resp.id) else {
            tracing::debug!(id = resp.id, "discarding response with unmatched id");
            return;
        };
        let outcome = match resp.error {
            Some(err) => Err(RpcError::Remote(err)),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        };
        let _ = resolver.send(outcome);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping resolvers rejects every in-flight call with `Closed`.
        self.pending().clear();
    }
}

/// Drops a call's resolver once the call is no longer awaited. A late
/// response for `id` is then discarded as unmatched.
struct Forget<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for Forget<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

/// Issues requests to the remote side. Cheap to clone.
#[derive(Clone)]
pub struct Caller {
    shared: Arc<Shared>,
}

impl Caller {
    /// Send `method` and wait for the matching response. There is no timeout:
    /// if the remote never replies, the returned future never resolves.
    /// Dropping the future abandons the call.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        // Covers early returns and callers that stop waiting.
        let _forget = Forget {
            shared: &self.shared,
            id,
        };
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }

        let request = RpcMessage::Request(RpcRequest {
            id,
            method: method.to_string(),
            params,
        });
        self.shared.send(&request)?;

        rx.await.map_err(|_| RpcError::Closed)?
    }

    /// Number of requests still waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

pub struct RpcPeer {
    shared: Arc<Shared>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl Default for RpcPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcPeer {
    pub fn new() -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                outbound,
                closed: AtomicBool::new(false),
            }),
            outbound_rx,
        }
    }

    /// Caller for this peer. Available before `run` so handlers can hold one.
    pub fn caller(&self) -> Caller {
        Caller {
            shared: self.shared.clone(),
        }
    }

    /// Drive the channel until the remote closes it or the transport fails.
    /// On exit every pending call is rejected with [`RpcError::Closed`].
    pub async fn run<R, W, H>(self, reader: R, writer: W, handler: Arc<H>) -> Result<(), RpcError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        H: RpcHandler,
    {
        let RpcPeer {
            shared,
            mut outbound_rx,
        } = self;

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = outbound_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<RpcRequest>();
        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            while let Some(req) = request_rx.recv().await {
                let resp = serve(handler.as_ref(), req).await;
                worker_shared.respond(resp);
            }
        });
        let _teardown = Teardown {
            shared: shared.clone(),
            tasks: vec![worker, writer_task],
        };

        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match classify(&line) {
                    Inbound::Request(req) => {
                        if request_tx.send(req).is_err() {
                            break Ok(());
                        }
                    }
                    Inbound::Response(resp) => shared.resolve(resp),
                    Inbound::BadRequest { id, reason } => {
                        tracing::warn!(id, %reason, "rejecting malformed request");
                        shared.respond(RpcResponse::err(id, reason));
                    }
                    Inbound::Discard(reason) => {
                        tracing::warn!(%reason, "discarding inbound frame");
                    }
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(RpcError::Io(e)),
            }
        }
    }
}

async fn serve<H: RpcHandler>(handler: &H, req: RpcRequest) -> RpcResponse {
    let Some(method) = H::Method::from_name(&req.method) else {
        tracing::warn!(method = %req.method, "unknown rpc method");
        return RpcResponse::err(req.id, RpcError::UnknownMethod(req.method).to_string());
    };
    let outcome = AssertUnwindSafe(handler.handle(method, req.params))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(result)) => RpcResponse::ok(req.id, result),
        Ok(Err(e)) => RpcResponse::err(req.id, format!("{e:#}")),
        Err(_) => RpcResponse::err(req.id, format!("handler for '{}' panicked", method.name())),
    }
}
