//! App-side surface: routes, context, the trigger/lambda evaluator, and the
//! bootstrap a sandboxed app process uses to talk to its host.

pub mod client;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod module;
pub mod route;
pub mod rpc;

pub use client::{AppClient, AppEnv, ENV_APP_NAME, ENV_APP_TOKEN, ENV_HOST_ADDR};
pub use context::Context;
pub use error::AppError;
pub use evaluator::{Evaluator, LogSink};
pub use module::AppModule;
pub use route::{Lambda, Route, RouteBuilder, Trigger};
pub use rpc::AppRpc;

pub use lambdas_types as types;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Intended for sandboxed app processes; safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
