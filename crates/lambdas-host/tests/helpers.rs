//! Shared builders for host integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lambdas_app::types::{Configuration, FieldType, Payload, WatchLeaf};
use lambdas_app::{AppModule, Route};
use lambdas_host::fixtures::MockChainProvider;
use lambdas_host::{AppLoader, AppsManager, HostConfig, LambdaApp, StaticSettings};
use serde_json::{Value, json};

pub const TRANSFER: &str = "event.Balances.Transfer";
pub const ACCOUNT: &str = "storage.System.Account";

pub fn config() -> HostConfig {
    HostConfig::default()
        .with_relays(["c1", "c2"])
        .with_listen_addr("127.0.0.1:0")
}

pub fn settings() -> StaticSettings {
    StaticSettings::new()
        .with("whales", "threshold", json!(1000))
        .with("remote-whales", "threshold", json!(1000))
}

pub fn manager(provider: &MockChainProvider) -> Arc<AppsManager> {
    Arc::new(AppsManager::new(
        config(),
        Arc::new(provider.clone()),
        Arc::new(settings()),
    ))
}

/// Counts lambda runs.
#[derive(Clone, Default)]
pub struct Fired(Arc<AtomicUsize>);

impl Fired {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// One route on `event.Balances.Transfer` that fires above the
/// `threshold` setting.
pub fn whale_module(chain: &str, fired: &Fired) -> AppModule {
    let fired = fired.clone();
    AppModule::new()
        .config(Configuration::description("large transfers"))
        .config(Configuration::setting("threshold", FieldType::Number))
        .route(
            Route::builder([WatchLeaf::event(chain, TRANSFER)])
                .trigger(|p, ctx| {
                    let threshold = ctx.setting("threshold").and_then(Value::as_u64).unwrap_or(0);
                    Ok(p.get("amount").and_then(Value::as_u64).unwrap_or(0) > threshold)
                })
                .lambda(move |_, _| {
                    let fired = fired.clone();
                    async move {
                        fired.bump();
                        anyhow::Ok(())
                    }
                })
                .build(),
        )
}

/// Records every payload the lambda sees.
pub fn recording_module(leaves: Vec<WatchLeaf>, seen: Arc<std::sync::Mutex<Vec<Payload>>>) -> AppModule {
    AppModule::new().route(
        Route::builder(leaves)
            .lambda(move |payload, _| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(payload);
                    anyhow::Ok(())
                }
            })
            .build(),
    )
}

pub fn loader(module: AppModule) -> AppLoader {
    Box::new(move || anyhow::Ok(module))
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Poll until `app` reports alive or dead.
pub async fn wait_loaded(app: &LambdaApp) {
    for _ in 0..100 {
        if app.state() != lambdas_host::AppState::Loading {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("app {} never finished loading", app.name());
}
