use std::sync::Arc;

use async_trait::async_trait;
use lambdas_rpc::{AppAway, HostMethod, RpcHandler, param};
use lambdas_types::{Configuration, WatchLeaf};
use serde_json::Value;

use crate::app::LambdaApp;
use crate::manager::AppsManager;

/// Host methods served to one connected sandboxed app.
pub struct HostRpc {
    manager: Arc<AppsManager>,
    app: Arc<LambdaApp>,
    away: AppAway,
}

impl HostRpc {
    pub fn new(manager: Arc<AppsManager>, app: Arc<LambdaApp>, away: AppAway) -> Self {
        Self { manager, app, away }
    }
}

#[async_trait]
impl RpcHandler for HostRpc {
    type Method = HostMethod;

    async fn handle(&self, method: HostMethod, params: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            HostMethod::Register => {
                let configurations: Vec<Configuration> = param(&params, 0, "register")?;
                let observed: Vec<Vec<WatchLeaf>> = param(&params, 1, "register")?;
                let settings = self
                    .manager
                    .register_remote(&self.app, self.away.clone(), &configurations, &observed)
                    .await?;
                Ok(serde_json::to_value(settings)?)
            }
        }
    }
}
