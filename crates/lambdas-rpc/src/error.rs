use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("remote error: {0}")]
    Remote(String),
    #[error("rpc channel closed")]
    Closed,
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error("invalid params for '{method}': {reason}")]
    InvalidParams { method: String, reason: String },
    #[error("handshake rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
