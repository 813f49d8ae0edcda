use lambdas_rpc::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing environment variable {0}")]
    Env(&'static str),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registration failed: {0}")]
    Register(String),
    #[error("no route at index {0}")]
    UnknownRoute(usize),
}
