//! Bootstrap for an app running in its own process: connect to the host,
//! authenticate, register, then serve payloads until the host goes away.

use std::sync::{Arc, Mutex};

use lambdas_rpc::{HostAway, RpcPeer, handshake};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::AppError;
use crate::evaluator::Evaluator;
use crate::module::AppModule;
use crate::rpc::AppRpc;

pub const ENV_HOST_ADDR: &str = "LAMBDAS_HOST_ADDR";
pub const ENV_APP_TOKEN: &str = "LAMBDAS_APP_TOKEN";
pub const ENV_APP_NAME: &str = "LAMBDAS_APP_NAME";

/// Connection parameters handed to a sandboxed process by its launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEnv {
    pub host_addr: String,
    pub token: String,
    pub name: String,
}

impl AppEnv {
    pub fn from_env() -> Result<Self, AppError> {
        let read = |key: &'static str| std::env::var(key).map_err(|_| AppError::Env(key));
        Ok(Self {
            host_addr: read(ENV_HOST_ADDR)?,
            token: read(ENV_APP_TOKEN)?,
            name: std::env::var(ENV_APP_NAME).unwrap_or_else(|_| "app".into()),
        })
    }
}

/// An authenticated channel to the host, ready to register a module.
pub struct AppClient<R, W> {
    name: String,
    reader: R,
    writer: W,
    logs: Option<Arc<Mutex<Vec<String>>>>,
}

impl AppClient<BufReader<OwnedReadHalf>, OwnedWriteHalf> {
    pub async fn connect(addr: &str, token: &str, name: &str) -> Result<Self, AppError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Self::handshake(BufReader::new(read), write, token, name).await
    }

    pub async fn from_env() -> Result<Self, AppError> {
        let env = AppEnv::from_env()?;
        Self::connect(&env.host_addr, &env.token, &env.name).await
    }
}

impl<R, W> AppClient<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Present `token` over an already-open transport.
    pub async fn handshake(
        mut reader: R,
        mut writer: W,
        token: &str,
        name: &str,
    ) -> Result<Self, AppError> {
        handshake::connect(&mut reader, &mut writer, token).await?;
        tracing::debug!(app = %name, "handshake accepted");
        Ok(Self {
            name: name.to_string(),
            reader,
            writer,
            logs: None,
        })
    }

    /// Also collect evaluation failures into `logs`.
    pub fn with_logs(mut self, logs: Arc<Mutex<Vec<String>>>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Register `module` and serve host requests until the channel closes.
    pub async fn run(self, module: AppModule) -> Result<(), AppError> {
        let AppClient {
            name,
            reader,
            writer,
            logs,
        } = self;

        let mut evaluator = Evaluator::new(name.as_str());
        if let Some(logs) = logs {
            evaluator = evaluator.with_log(Arc::new(move |line| {
                logs.lock().unwrap_or_else(|e| e.into_inner()).push(line);
            }));
        }

        let configurations = module.configurations.clone();
        let observed = module.observed_leaves();
        let handler = Arc::new(AppRpc::new(evaluator, module.routes));

        let peer = RpcPeer::new();
        let host = HostAway::new(peer.caller());
        let serving = peer.run(reader, writer, handler.clone());
        tokio::pin!(serving);

        let registered = tokio::select! {
            res = host.register(&configurations, &observed) => res,
            res = &mut serving => {
                res?;
                return Err(AppError::Register("host closed the channel before replying".into()));
            }
        };
        let settings = registered.map_err(|e| AppError::Register(e.to_string()))?;
        tracing::info!(app = %name, routes = observed.len(), "registered with host");
        handler.apply_settings(settings);

        serving.await.map_err(AppError::from)
    }
}
