//! The host's record of one loaded app.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lambdas_app::{LogSink, Route};
use lambdas_rpc::AppAway;
use lambdas_types::{ChainId, FieldType, Permission, Settings, WatchLeaf};
use serde::Serialize;

use crate::dispatch::{PayloadFeed, Sink, Subscription, spawn_feed};
use crate::error::LoadError;

/// Subscriptions are keyed by route index and leaf, so the same leaf watched
/// by two routes gets two independent subscriptions.
pub type SubscriptionKey = (usize, WatchLeaf);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Trusted; triggers and lambdas run in the host process.
    Local,
    /// Runs in its own process and talks to the host over RPC.
    Sandboxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Loading,
    Alive,
    Dead,
}

#[derive(Default)]
struct Record {
    description: Option<String>,
    chains: BTreeMap<ChainId, usize>,
    permissions: Vec<Permission>,
    setting_types: BTreeMap<String, FieldType>,
    settings: Settings,
    routes: Vec<Route>,
    route_count: usize,
}

/// Diagnostic snapshot of one app.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub kind: AppKind,
    pub state: AppState,
    pub alive: bool,
    pub description: Option<String>,
    pub chains: BTreeMap<ChainId, usize>,
    pub permissions: Vec<Permission>,
    pub routes: usize,
    pub subscriptions: usize,
    pub logs: Vec<String>,
}

pub struct LambdaApp {
    name: String,
    kind: AppKind,
    state: Mutex<AppState>,
    record: Mutex<Record>,
    logs: Arc<Mutex<Vec<String>>>,
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
    remote: Mutex<Option<AppAway>>,
    cancelled: AtomicBool,
    next_subscription: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LambdaApp {
    pub(crate) fn new(name: impl Into<String>, kind: AppKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            state: Mutex::new(AppState::Loading),
            record: Mutex::new(Record::default()),
            logs: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Mutex::new(HashMap::new()),
            remote: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            next_subscription: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AppKind {
        self.kind
    }

    pub fn state(&self) -> AppState {
        *lock(&self.state)
    }

    pub fn is_alive(&self) -> bool {
        self.state() == AppState::Alive
    }

    pub fn description(&self) -> Option<String> {
        lock(&self.record).description.clone()
    }

    /// Reference count per chain across every leaf of every route.
    pub fn chains(&self) -> BTreeMap<ChainId, usize> {
        lock(&self.record).chains.clone()
    }

    /// Settings as last resolved or pushed.
    pub fn settings(&self) -> Settings {
        lock(&self.record).settings.clone()
    }

    /// Declared type of every setting field.
    pub fn setting_types(&self) -> BTreeMap<String, FieldType> {
        lock(&self.record).setting_types.clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        lock(&self.record).routes.clone()
    }

    pub fn logs(&self) -> Vec<String> {
        lock(&self.logs).clone()
    }

    pub fn log(&self, line: impl Into<String>) {
        lock(&self.logs).push(line.into());
    }

    /// Appends evaluation failures to this app's log trail.
    pub fn log_sink(&self) -> LogSink {
        let logs = self.logs.clone();
        Arc::new(move |line| lock(&logs).push(line))
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn subscribed_leaves(&self) -> Vec<SubscriptionKey> {
        lock(&self.subscriptions).keys().cloned().collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_description(&self, description: Option<String>) {
        lock(&self.record).description = description;
    }

    pub(crate) fn set_permissions(&self, permissions: Vec<Permission>) {
        lock(&self.record).permissions = permissions;
    }

    pub(crate) fn set_settings(&self, types: BTreeMap<String, FieldType>, settings: Settings) {
        let mut record = lock(&self.record);
        record.setting_types = types;
        record.settings = settings;
    }

    pub(crate) fn replace_settings(&self, settings: Settings) {
        lock(&self.record).settings = settings;
    }

    /// Channel to a registered sandboxed app. `None` for trusted apps and
    /// once the app is shut down.
    pub(crate) fn remote(&self) -> Option<AppAway> {
        lock(&self.remote).clone()
    }

    pub(crate) fn set_remote(&self, away: AppAway) {
        *lock(&self.remote) = Some(away);
    }

    pub(crate) fn set_chains(&self, chains: BTreeMap<ChainId, usize>) {
        lock(&self.record).chains = chains;
    }

    pub(crate) fn set_routes(&self, routes: Vec<Route>) {
        let mut record = lock(&self.record);
        record.route_count = routes.len();
        record.routes = routes;
    }

    /// Sandboxed apps keep their routes; the host only knows how many.
    pub(crate) fn set_remote_routes(&self, count: usize) {
        lock(&self.record).route_count = count;
    }

    /// Leave `Loading` for `Alive`. A cancelled app stays dead.
    pub(crate) fn mark_alive(&self) -> Result<(), LoadError> {
        let mut state = lock(&self.state);
        if self.is_cancelled() || *state == AppState::Dead {
            return Err(LoadError::Cancelled);
        }
        *state = AppState::Alive;
        Ok(())
    }

    /// Permanently dead: record `error`, drop routes, cancel subscriptions.
    pub(crate) fn fail(&self, error: &LoadError) {
        self.log(format!("Error loading {}: {error}", self.name));
        {
            let mut record = lock(&self.record);
            record.routes.clear();
            record.route_count = 0;
        }
        self.shutdown();
    }

    /// Install a running subscription for `key`. Refused once the app has been
    /// cancelled, in which case `feed` is dropped and nothing is left running.
    pub(crate) fn attach(
        self: &Arc<Self>,
        key: SubscriptionKey,
        feed: PayloadFeed,
        sink: Sink,
    ) -> Result<(), LoadError> {
        let mut subscriptions = lock(&self.subscriptions);
        if self.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let owner: Weak<Self> = Arc::downgrade(self);
        let ended = key.clone();
        let subscription = spawn_feed(id, feed, sink, move || {
            if let Some(app) = owner.upgrade() {
                app.detach(&ended, id);
            }
        });
        if let Some(previous) = subscriptions.insert(key, subscription) {
            previous.cancel();
        }
        Ok(())
    }

    fn detach(&self, key: &SubscriptionKey, id: u64) {
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.get(key).is_some_and(|s| s.id() == id) {
            subscriptions.remove(key);
            tracing::debug!(app = %self.name, path = %key.1.path, "subscription ended");
        }
    }

    /// Cancel every subscription. Idempotent; later `attach` calls are refused.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let drained: Vec<Subscription> = lock(&self.subscriptions).drain().map(|(_, s)| s).collect();
        for subscription in &drained {
            subscription.cancel();
        }
        if !drained.is_empty() {
            tracing::debug!(app = %self.name, count = drained.len(), "cancelled subscriptions");
        }
    }

    /// Cancel and mark dead. The record stays for diagnostics.
    pub fn shutdown(&self) {
        self.cancel();
        lock(&self.remote).take();
        *lock(&self.state) = AppState::Dead;
    }

    pub fn status(&self) -> AppStatus {
        let record = lock(&self.record);
        let state = self.state();
        AppStatus {
            name: self.name.clone(),
            kind: self.kind,
            state,
            alive: state == AppState::Alive,
            description: record.description.clone(),
            chains: record.chains.clone(),
            permissions: record.permissions.clone(),
            routes: record.route_count,
            subscriptions: self.subscription_count(),
            logs: self.logs(),
        }
    }
}

/// Per-chain reference counts for every leaf of every route.
pub fn count_chains<'a>(routes: impl IntoIterator<Item = &'a [WatchLeaf]>) -> BTreeMap<ChainId, usize> {
    let mut chains = BTreeMap::new();
    for leaves in routes {
        for leaf in leaves {
            *chains.entry(leaf.chain.clone()).or_insert(0) += 1;
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use lambdas_app::{Context, Evaluator};
    use lambdas_types::Payload;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn receiver_feed(mut rx: mpsc::UnboundedReceiver<Payload>) -> PayloadFeed {
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }

    fn local_sink(app: &LambdaApp) -> Sink {
        Sink::Local {
            evaluator: Evaluator::new(app.name()).with_log(app.log_sink()),
            route: Route::builder([]).build(),
            context: Context::default(),
        }
    }

    #[tokio::test]
    async fn attach_after_cancel_is_refused() {
        let app = LambdaApp::new("demo", AppKind::Local);
        app.cancel();
        let (_tx, rx) = mpsc::unbounded_channel();
        let leaf = WatchLeaf::event("c1", "event.System.Remarked");
        let err = app
            .attach((0, leaf), receiver_feed(rx), local_sink(&app))
            .unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
        assert_eq!(app.subscription_count(), 0);
    }

    #[tokio::test]
    async fn finished_feed_removes_its_entry() {
        let app = LambdaApp::new("demo", AppKind::Local);
        let (tx, rx) = mpsc::unbounded_channel();
        let leaf = WatchLeaf::event("c1", "event.System.Remarked");
        app.attach((0, leaf.clone()), receiver_feed(rx), local_sink(&app))
            .unwrap();
        assert_eq!(app.subscription_count(), 1);

        tx.send(Payload::event(&leaf, json!({}))).unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(app.subscription_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_keeps_the_record() {
        let app = LambdaApp::new("demo", AppKind::Local);
        app.set_description(Some("watches remarks".into()));
        app.mark_alive().unwrap();
        app.shutdown();
        app.shutdown();
        let status = app.status();
        assert_eq!(status.state, AppState::Dead);
        assert_eq!(status.description.as_deref(), Some("watches remarks"));
        assert!(app.mark_alive().is_err());
    }

    #[test]
    fn chains_are_reference_counted() {
        let routes = [
            vec![
                WatchLeaf::event("c1", "event.Balances.Transfer"),
                WatchLeaf::event("c1_assets", "event.Assets.Issued"),
            ],
            vec![WatchLeaf::event("c1", "event.System.Remarked")],
        ];
        let counts = count_chains(routes.iter().map(Vec::as_slice));
        assert_eq!(counts[&ChainId::from("c1")], 2);
        assert_eq!(counts[&ChainId::from("c1_assets")], 1);
    }
}
