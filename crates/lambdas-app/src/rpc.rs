//! The method table a sandboxed app serves to its host.

use std::sync::Arc;

use async_trait::async_trait;
use lambdas_rpc::{AppMethod, RpcHandler, param};
use lambdas_types::{Payload, Settings};
use serde_json::Value;
use tokio::sync::watch;

use crate::context::Context;
use crate::error::AppError;
use crate::evaluator::Evaluator;
use crate::route::Route;

/// Serves `pushPayload` and `setSettings`.
///
/// Payloads that arrive before the first settings are applied wait for them,
/// so no trigger ever observes an unconfigured context.
pub struct AppRpc {
    routes: Arc<Vec<Route>>,
    evaluator: Evaluator,
    context: watch::Sender<Option<Context>>,
}

impl AppRpc {
    pub fn new(evaluator: Evaluator, routes: Vec<Route>) -> Self {
        let (context, _) = watch::channel(None);
        Self {
            routes: Arc::new(routes),
            evaluator,
            context,
        }
    }

    /// Replace the settings seen by subsequent evaluations.
    pub fn apply_settings(&self, settings: Settings) {
        self.context.send_modify(|ctx| {
            let next = match ctx {
                Some(current) => current.with_settings(settings),
                None => Context::default().with_settings(settings),
            };
            *ctx = Some(next);
        });
    }

    async fn ready_context(&self) -> Context {
        let mut rx = self.context.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(ctx) => ctx.clone().unwrap_or_default(),
            // The sender lives in `self`, so this is unreachable while we run.
            Err(_) => Context::default(),
        }
    }

    fn route(&self, index: usize) -> Result<&Route, AppError> {
        self.routes.get(index).ok_or(AppError::UnknownRoute(index))
    }
}

#[async_trait]
impl RpcHandler for AppRpc {
    type Method = AppMethod;

    async fn handle(&self, method: AppMethod, params: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            AppMethod::PushPayload => {
                let index: usize = param(&params, 0, "pushPayload")?;
                let payload: Payload = param(&params, 1, "pushPayload")?;
                let route = self.route(index)?;
                let context = self.ready_context().await;
                // Evaluation is fire-and-forget; the host gets its ack immediately.
                drop(self.evaluator.process(route, payload, context));
                Ok(Value::Null)
            }
            AppMethod::SetSettings => {
                let settings: Settings = param(&params, 0, "setSettings")?;
                self.apply_settings(settings);
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambdas_types::WatchLeaf;
    use serde_json::json;

    fn rpc() -> AppRpc {
        let route = Route::builder([WatchLeaf::event("c1", "event.System.Remarked")]).build();
        AppRpc::new(Evaluator::new("demo"), vec![route])
    }

    #[tokio::test]
    async fn push_to_missing_route_is_an_error() {
        let rpc = rpc();
        rpc.apply_settings(Settings::new());
        let leaf = WatchLeaf::event("c1", "event.System.Remarked");
        let payload = serde_json::to_value(Payload::event(&leaf, json!({}))).unwrap();
        let err = rpc
            .handle(AppMethod::PushPayload, vec![json!(3), payload])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no route at index 3"));
    }

    #[tokio::test]
    async fn set_settings_replaces_context() {
        let rpc = rpc();
        rpc.handle(AppMethod::SetSettings, vec![json!({ "threshold": 7 })])
            .await
            .unwrap();
        let ctx = rpc.ready_context().await;
        assert_eq!(ctx.setting("threshold"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn malformed_params_are_rejected() {
        let err = rpc()
            .handle(AppMethod::PushPayload, vec![json!("zero")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pushPayload"));
    }
}
