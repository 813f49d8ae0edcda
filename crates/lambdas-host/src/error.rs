use lambdas_rpc::RpcError;
use lambdas_types::{ChainError, LeafError, SettingError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid watch leaf: {0}")]
    Leaf(#[from] LeafError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("setting error: {0}")]
    Setting(#[from] SettingError),
    #[error("no value for setting '{field}' of app '{app}'")]
    MissingSetting { app: String, field: String },
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("unknown session token")]
    Unauthorized,
    #[error("app '{app}' failed to load: {reason}")]
    Load { app: String, reason: String },
    #[error("unknown app '{0}'")]
    UnknownApp(String),
    #[error("app '{app}' declares no setting '{field}'")]
    UnknownSetting { app: String, field: String },
    #[error("app '{0}' has no live channel")]
    NotConnected(String),
    #[error("app '{0}' already exists")]
    DuplicateApp(String),
    #[error("settings store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("launcher error: {0}")]
    Launcher(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an app ended up dead. Rendered into the app's log trail.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module failed: {0}")]
    Module(String),
    #[error("module panicked: {0}")]
    Panicked(String),
    #[error("setting '{0}' is declared more than once")]
    DuplicateSetting(String),
    #[error("route {route}: {source}")]
    Route {
        route: usize,
        #[source]
        source: HostError,
    },
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("app was shut down while loading")]
    Cancelled,
}
