//! Host runtime: connects apps to live chain feeds.
//!
//! The [`AppsManager`] owns chain connections (one per chain, shared), loads
//! trusted apps in-process, and serves sandboxed apps over [`HostServer`].

pub mod app;
pub mod chains;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod rpc;
pub mod server;
pub mod settings;

#[cfg(any(feature = "test-fixtures", test))]
pub mod fixtures;

pub use app::{AppKind, AppState, AppStatus, LambdaApp, SubscriptionKey};
pub use chains::ChainRegistry;
pub use config::HostConfig;
pub use dispatch::{PayloadFeed, Sink, Subscription, open_feed, spawn_feed};
pub use error::{HostError, LoadError};
pub use launcher::{AppLauncher, LaunchEnv, LaunchSpec, LaunchedApp, ProcessLauncher};
pub use manager::{AppLoader, AppsManager};
pub use rpc::HostRpc;
pub use server::HostServer;
pub use settings::{
    AppConfig, Prompt, SettingsResolver, SqliteSettingsStore, StaticSettings, StdinPrompt,
    StoredSettingsResolver, load_configurations,
};
