//! Starting sandboxed apps as isolated execution units.

use std::path::PathBuf;

use async_trait::async_trait;
use lambdas_app::{ENV_APP_NAME, ENV_APP_TOKEN, ENV_HOST_ADDR};
use tokio::process::{Child, Command};

use crate::error::HostError;

/// Identity and channel location handed to a launched app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    pub host_addr: String,
    pub token: String,
    pub name: String,
}

impl LaunchEnv {
    pub fn vars(&self) -> [(&'static str, &str); 3] {
        [
            (ENV_HOST_ADDR, self.host_addr.as_str()),
            (ENV_APP_TOKEN, self.token.as_str()),
            (ENV_APP_NAME, self.name.as_str()),
        ]
    }
}

/// What to run for one sandboxed app.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A running sandboxed app the host can stop.
#[async_trait]
pub trait LaunchedApp: Send {
    async fn kill(&mut self) -> Result<(), HostError>;
}

#[async_trait]
pub trait AppLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec, env: &LaunchEnv) -> Result<Box<dyn LaunchedApp>, HostError>;
}

/// Spawns each app as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl AppLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec, env: &LaunchEnv) -> Result<Box<dyn LaunchedApp>, HostError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        for (key, value) in env.vars() {
            command.env(key, value);
        }
        let child = command.spawn().map_err(|e| {
            HostError::Launcher(format!("failed to start {}: {e}", spec.program.display()))
        })?;
        tracing::info!(app = %env.name, pid = child.id(), "launched sandboxed app");
        Ok(Box::new(ChildApp { child }))
    }
}

struct ChildApp {
    child: Child,
}

#[async_trait]
impl LaunchedApp for ChildApp {
    async fn kill(&mut self) -> Result<(), HostError> {
        match self.child.try_wait()? {
            Some(_) => Ok(()),
            None => Ok(self.child.kill().await?),
        }
    }
}
