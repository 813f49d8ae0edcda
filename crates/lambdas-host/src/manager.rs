//! The apps manager: owns every loaded app, the shared chain connections,
//! and the lifecycle of sandboxed app processes.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use lambdas_app::{AppModule, Context, Evaluator};
use lambdas_rpc::AppAway;
use lambdas_types::{
    ChainConnection, ChainError, ChainId, ChainProvider, Configuration, SettingError, Settings,
    WatchLeaf,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::app::{AppKind, AppState, AppStatus, LambdaApp, count_chains};
use crate::chains::ChainRegistry;
use crate::config::HostConfig;
use crate::dispatch::{Sink, open_feed};
use crate::error::{HostError, LoadError};
use crate::launcher::{AppLauncher, LaunchEnv, LaunchSpec, LaunchedApp, ProcessLauncher};
use crate::settings::{AppConfig, SettingsResolver, StoredSettingsResolver, load_configurations};

/// Produces a trusted app's module. Errors and panics fail only that app.
pub type AppLoader = Box<dyn FnOnce() -> anyhow::Result<AppModule> + Send>;

type Connections = BTreeMap<ChainId, Arc<dyn ChainConnection>>;

pub struct AppsManager {
    config: HostConfig,
    chains: ChainRegistry,
    settings: Arc<dyn SettingsResolver>,
    launcher: Arc<dyn AppLauncher>,
    apps: Mutex<BTreeMap<String, Arc<LambdaApp>>>,
    tokens: Mutex<HashMap<String, Arc<LambdaApp>>>,
    children: tokio::sync::Mutex<Vec<(String, Box<dyn LaunchedApp>)>>,
    host_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: broadcast::Sender<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

/// Every leaf must name an `event` or `storage` path before anything is
/// subscribed.
fn validate_leaves(observed: &[Vec<WatchLeaf>]) -> Result<(), LoadError> {
    for (route, leaves) in observed.iter().enumerate() {
        for leaf in leaves {
            leaf.watch_path().map_err(|e| LoadError::Route {
                route,
                source: e.into(),
            })?;
        }
    }
    Ok(())
}

impl AppsManager {
    pub fn new(
        config: HostConfig,
        provider: Arc<dyn ChainProvider>,
        settings: Arc<dyn SettingsResolver>,
    ) -> Self {
        let chains = ChainRegistry::new(provider, config.relay_chains.clone());
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            chains,
            settings,
            launcher: Arc::new(ProcessLauncher),
            apps: Mutex::new(BTreeMap::new()),
            tokens: Mutex::new(HashMap::new()),
            children: tokio::sync::Mutex::new(Vec::new()),
            host_addr: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Settings from `config.settings_db` with an interactive fallback.
    pub fn from_config(config: HostConfig, provider: Arc<dyn ChainProvider>) -> Result<Self, HostError> {
        let settings = StoredSettingsResolver::from_config(&config)?;
        Ok(Self::new(config, provider, Arc::new(settings)))
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn AppLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    pub fn app(&self, name: &str) -> Option<Arc<LambdaApp>> {
        lock(&self.apps).get(name).cloned()
    }

    pub fn apps(&self) -> Vec<Arc<LambdaApp>> {
        lock(&self.apps).values().cloned().collect()
    }

    /// Snapshot of every app, dead ones included.
    pub fn status(&self) -> Vec<AppStatus> {
        self.apps().iter().map(|app| app.status()).collect()
    }

    fn insert(&self, app: Arc<LambdaApp>) -> Result<(), HostError> {
        let mut apps = lock(&self.apps);
        if apps.contains_key(app.name()) {
            return Err(HostError::DuplicateApp(app.name().to_string()));
        }
        apps.insert(app.name().to_string(), app);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Trusted apps
    // ---------------------------------------------------------------------

    /// Load a trusted app and dispatch its routes in this process. The app is
    /// returned dead rather than as an error when its own load fails.
    pub async fn load_local(&self, name: &str, loader: AppLoader) -> Result<Arc<LambdaApp>, HostError> {
        let app = LambdaApp::new(name, AppKind::Local);
        self.insert(app.clone())?;

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(loader)) {
            Ok(Ok(module)) => self.launch_local(&app, module).await,
            Ok(Err(e)) => Err(LoadError::Module(format!("{e:#}"))),
            Err(panic) => Err(LoadError::Panicked(panic_message(panic.as_ref()))),
        };
        self.finish_launch(&app, outcome);
        Ok(app)
    }

    /// Load many trusted apps concurrently. Names starting with `_` are
    /// disabled and skipped.
    pub async fn load_local_batch(&self, loaders: Vec<(String, AppLoader)>) -> Vec<Arc<LambdaApp>> {
        let loads = loaders.into_iter().filter_map(|(name, loader)| {
            if name.starts_with('_') {
                tracing::info!(app = %name, "skipping disabled app");
                return None;
            }
            Some(async move {
                match self.load_local(&name, loader).await {
                    Ok(app) => Some(app),
                    Err(e) => {
                        tracing::error!(app = %name, error = %e, "app not loaded");
                        None
                    }
                }
            })
        });
        join_all(loads).await.into_iter().flatten().collect()
    }

    async fn launch_local(&self, app: &Arc<LambdaApp>, module: AppModule) -> Result<(), LoadError> {
        let AppModule {
            configurations,
            routes,
        } = module;
        let observed: Vec<Vec<WatchLeaf>> = routes.iter().map(|r| r.watching().to_vec()).collect();
        let config = self.prepare(app, &configurations, &observed).await?;
        let connections = self.connect(app, &observed).await?;

        let context = Context::new(connections.clone(), config.settings);
        let evaluator = Evaluator::new(app.name()).with_log(app.log_sink());
        for (index, route) in routes.iter().enumerate() {
            for leaf in route.watching() {
                let sink = Sink::Local {
                    evaluator: evaluator.clone(),
                    route: route.clone(),
                    context: context.clone(),
                };
                self.subscribe(app, &connections, index, leaf, sink).await?;
            }
        }
        app.set_routes(routes);
        app.mark_alive()
    }

    // ---------------------------------------------------------------------
    // Sandboxed apps
    // ---------------------------------------------------------------------

    /// Record the address sandboxed apps should connect to.
    pub fn advertise(&self, addr: SocketAddr) {
        *lock(&self.host_addr) = Some(addr);
    }

    pub fn host_addr(&self) -> Option<SocketAddr> {
        *lock(&self.host_addr)
    }

    /// Create a sandboxed app record and the session token it must present.
    pub fn provision(&self, name: &str) -> Result<(Arc<LambdaApp>, String), HostError> {
        let app = LambdaApp::new(name, AppKind::Sandboxed);
        self.insert(app.clone())?;
        let token = Uuid::new_v4().to_string();
        lock(&self.tokens).insert(token.clone(), app.clone());
        tracing::debug!(app = %name, "provisioned session token");
        Ok((app, token))
    }

    /// Provision `name` and start it with the configured launcher.
    pub async fn launch_sandboxed(&self, name: &str, spec: &LaunchSpec) -> Result<Arc<LambdaApp>, HostError> {
        let host_addr = self
            .host_addr()
            .ok_or_else(|| HostError::Launcher("host channel is not listening".into()))?;
        let (app, token) = self.provision(name)?;
        let env = LaunchEnv {
            host_addr: host_addr.to_string(),
            token: token.clone(),
            name: name.to_string(),
        };
        match self.launcher.launch(spec, &env).await {
            Ok(child) => {
                self.children.lock().await.push((name.to_string(), child));
                Ok(app)
            }
            Err(e) => {
                lock(&self.tokens).remove(&token);
                let reason = e.to_string();
                self.finish_launch(&app, Err(LoadError::Host(e)));
                Err(HostError::Load {
                    app: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Consume `token`. Only apps still waiting to register are admitted.
    pub fn authorize(&self, token: &str) -> Option<Arc<LambdaApp>> {
        let app = lock(&self.tokens).remove(token)?;
        (app.state() == AppState::Loading && !app.is_cancelled()).then_some(app)
    }

    /// Handle a sandboxed app's `register`: resolve settings, dispatch every
    /// leaf with `away` as the sink, and reply with the settings.
    pub async fn register_remote(
        &self,
        app: &Arc<LambdaApp>,
        away: AppAway,
        configurations: &[Configuration],
        observed: &[Vec<WatchLeaf>],
    ) -> Result<Settings, HostError> {
        if app.state() != AppState::Loading {
            return Err(HostError::Load {
                app: app.name().to_string(),
                reason: "already registered".into(),
            });
        }
        match self.launch_remote(app, away, configurations, observed).await {
            Ok(settings) => {
                self.finish_launch(app, Ok(()));
                Ok(settings)
            }
            Err(e) => {
                let reason = e.to_string();
                self.finish_launch(app, Err(e));
                Err(HostError::Load {
                    app: app.name().to_string(),
                    reason,
                })
            }
        }
    }

    async fn launch_remote(
        &self,
        app: &Arc<LambdaApp>,
        away: AppAway,
        configurations: &[Configuration],
        observed: &[Vec<WatchLeaf>],
    ) -> Result<Settings, LoadError> {
        let config = self.prepare(app, configurations, observed).await?;
        let connections = self.connect(app, observed).await?;
        app.set_remote(away.clone());
        for (index, leaves) in observed.iter().enumerate() {
            for leaf in leaves {
                let sink = Sink::Remote {
                    app: away.clone(),
                    route_index: index,
                };
                self.subscribe(app, &connections, index, leaf, sink).await?;
            }
        }
        app.set_remote_routes(observed.len());
        app.mark_alive()?;
        Ok(config.settings)
    }

    /// Replace some of a running sandboxed app's settings. Every field must be
    /// declared by the app with a matching type. New values are persisted
    /// through the settings resolver, then the merged settings are pushed to
    /// the app, which applies them to every later evaluation.
    pub async fn update_settings(&self, name: &str, updates: Settings) -> Result<(), HostError> {
        let app = self
            .app(name)
            .ok_or_else(|| HostError::UnknownApp(name.to_string()))?;
        let types = app.setting_types();
        let mut checked = Vec::with_capacity(updates.len());
        for (field, value) in updates {
            let field_type = *types.get(&field).ok_or_else(|| HostError::UnknownSetting {
                app: name.to_string(),
                field: field.clone(),
            })?;
            if !field_type.accepts(&value) {
                return Err(SettingError::Invalid {
                    raw: value.to_string(),
                    field_type,
                }
                .into());
            }
            checked.push((field, field_type, value));
        }

        let away = app
            .remote()
            .filter(|_| app.is_alive())
            .ok_or_else(|| HostError::NotConnected(name.to_string()))?;

        let mut merged = app.settings();
        for (field, field_type, value) in checked {
            self.settings.persist(name, &field, field_type, &value).await?;
            merged.insert(field, value);
        }
        away.set_settings(&merged).await?;
        app.replace_settings(merged);
        tracing::info!(app = %name, "pushed updated settings");
        Ok(())
    }

    /// The sandboxed app's channel closed; its subscriptions go with it.
    pub fn disconnected(&self, app: &LambdaApp) {
        if app.state() != AppState::Dead {
            tracing::info!(app = %app.name(), "sandboxed app disconnected");
        }
        app.shutdown();
    }

    // ---------------------------------------------------------------------
    // Shared launch steps
    // ---------------------------------------------------------------------

    async fn prepare(
        &self,
        app: &LambdaApp,
        configurations: &[Configuration],
        observed: &[Vec<WatchLeaf>],
    ) -> Result<AppConfig, LoadError> {
        let config = load_configurations(self.settings.as_ref(), app.name(), configurations).await?;
        let types = configurations
            .iter()
            .filter_map(|c| match c {
                Configuration::Setting {
                    field_name,
                    field_type,
                } => Some((field_name.clone(), *field_type)),
                _ => None,
            })
            .collect();
        app.set_settings(types, config.settings.clone());
        app.set_description(config.description.clone());
        app.set_permissions(config.permissions.clone());
        validate_leaves(observed)?;
        Ok(config)
    }

    /// Connect every chain the app references, relays first.
    async fn connect(&self, app: &LambdaApp, observed: &[Vec<WatchLeaf>]) -> Result<Connections, LoadError> {
        let chains = count_chains(observed.iter().map(Vec::as_slice));
        app.set_chains(chains.clone());
        self.chains
            .connect_all(chains.keys())
            .await
            .map_err(|e| LoadError::Host(e.into()))
    }

    async fn subscribe(
        &self,
        app: &Arc<LambdaApp>,
        connections: &Connections,
        route: usize,
        leaf: &WatchLeaf,
        sink: Sink,
    ) -> Result<(), LoadError> {
        if app.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let conn = connections
            .get(&leaf.chain)
            .ok_or_else(|| LoadError::Route {
                route,
                source: HostError::Chain(ChainError::Connect {
                    chain: leaf.chain.clone(),
                    reason: "chain was not connected for this app".into(),
                }),
            })?;
        let feed = open_feed(conn.as_ref(), leaf)
            .await
            .map_err(|source| LoadError::Route { route, source })?;
        app.attach((route, leaf.clone()), feed, sink)
    }

    fn finish_launch(&self, app: &LambdaApp, outcome: Result<(), LoadError>) {
        match outcome {
            Ok(()) => {
                let status = app.status();
                let chains: Vec<String> = status
                    .chains
                    .iter()
                    .map(|(chain, n)| format!("{chain} ({n})"))
                    .collect();
                tracing::info!(
                    app = %status.name,
                    kind = ?status.kind,
                    description = status.description.as_deref().unwrap_or(""),
                    chains = %chains.join(", "),
                    subscriptions = status.subscriptions,
                    "app is alive"
                );
            }
            Err(e) => {
                app.fail(&e);
                for line in app.logs() {
                    tracing::error!(app = %app.name(), "{line}");
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    /// Receives one message when the manager shuts down.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Cancel every app, kill launched children, stop the channel listener.
    pub async fn shutdown(&self) {
        lock(&self.tokens).clear();
        for app in self.apps() {
            app.shutdown();
        }
        let mut children = self.children.lock().await;
        for (name, child) in children.iter_mut() {
            if let Err(e) = child.kill().await {
                tracing::warn!(app = %name, error = %e, "failed to stop sandboxed app");
            }
        }
        children.clear();
        let _ = self.shutdown_tx.send(());
        tracing::info!("apps manager shut down");
    }
}
