//! In-memory chain provider for tests. Enable with the `test-fixtures` feature.
//!
//! Feeds are `broadcast` channels keyed by `(chain, path)`; tests push raw
//! emissions with the `emit_*` helpers and inspect what the host subscribed to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use lambdas_types::{
    ChainConnection, ChainError, ChainId, ChainProvider, EntryBatch, FeedStream, Finality,
    RawEvent, WatchPath,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

type FeedKey = (ChainId, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Event,
    Entries,
    Value,
}

/// One subscription the host opened against the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub chain: ChainId,
    pub path: String,
    pub mode: SubscriptionMode,
    pub args: Vec<Value>,
    pub at: Option<Finality>,
}

#[derive(Default)]
struct State {
    connections: HashMap<ChainId, usize>,
    relays_used: HashMap<ChainId, ChainId>,
    failing: Vec<ChainId>,
    arity: HashMap<FeedKey, usize>,
    events: HashMap<FeedKey, broadcast::Sender<RawEvent>>,
    entries: HashMap<FeedKey, broadcast::Sender<EntryBatch>>,
    values: HashMap<FeedKey, broadcast::Sender<Value>>,
    subscriptions: Vec<SubscriptionRecord>,
}

#[derive(Clone, Default)]
pub struct MockChainProvider {
    state: Arc<Mutex<State>>,
}

fn key(chain: &ChainId, path: &str) -> FeedKey {
    (chain.clone(), path.to_string())
}

fn sender<T: Clone>(
    map: &mut HashMap<FeedKey, broadcast::Sender<T>>,
    key: FeedKey,
) -> broadcast::Sender<T> {
    map.entry(key)
        .or_insert_with(|| broadcast::channel(64).0)
        .clone()
}

fn feed<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> FeedStream<T> {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

impl MockChainProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare a storage item and the number of key arguments it takes.
    pub fn with_storage(self, chain: impl Into<ChainId>, path: &str, arity: usize) -> Self {
        self.state().arity.insert(key(&chain.into(), path), arity);
        self
    }

    /// Make every connect to `chain` fail.
    pub fn fail_connect(self, chain: impl Into<ChainId>) -> Self {
        self.state().failing.push(chain.into());
        self
    }

    pub fn connection_count(&self, chain: &ChainId) -> usize {
        self.state().connections.get(chain).copied().unwrap_or(0)
    }

    pub fn relay_used_by(&self, chain: &ChainId) -> Option<ChainId> {
        self.state().relays_used.get(chain).cloned()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.state().subscriptions.clone()
    }

    /// Live receivers on `(chain, path)` across all feed kinds.
    pub fn listener_count(&self, chain: &ChainId, path: &str) -> usize {
        let state = self.state();
        let k = key(chain, path);
        state.events.get(&k).map_or(0, |s| s.receiver_count())
            + state.entries.get(&k).map_or(0, |s| s.receiver_count())
            + state.values.get(&k).map_or(0, |s| s.receiver_count())
    }

    /// Returns the number of subscribers that received the event.
    pub fn emit_event(&self, chain: impl Into<ChainId>, path: &str, payload: Value) -> usize {
        let tx = sender(&mut self.state().events, key(&chain.into(), path));
        tx.send(RawEvent::new(payload)).unwrap_or(0)
    }

    pub fn emit_entries(&self, chain: impl Into<ChainId>, path: &str, batch: EntryBatch) -> usize {
        let tx = sender(&mut self.state().entries, key(&chain.into(), path));
        tx.send(batch).unwrap_or(0)
    }

    pub fn emit_value(&self, chain: impl Into<ChainId>, path: &str, value: Value) -> usize {
        let tx = sender(&mut self.state().values, key(&chain.into(), path));
        tx.send(value).unwrap_or(0)
    }

    /// End every feed on `(chain, path)`, as a chain does when it drops a
    /// subscription.
    pub fn close_feed(&self, chain: impl Into<ChainId>, path: &str) {
        let k = key(&chain.into(), path);
        let mut state = self.state();
        state.events.remove(&k);
        state.entries.remove(&k);
        state.values.remove(&k);
    }

    fn record(&self, record: SubscriptionRecord) {
        self.state().subscriptions.push(record);
    }
}

#[async_trait]
impl ChainProvider for MockChainProvider {
    async fn connect(
        &self,
        chain: &ChainId,
        relay: Option<Arc<dyn ChainConnection>>,
    ) -> Result<Arc<dyn ChainConnection>, ChainError> {
        let mut state = self.state();
        if state.failing.contains(chain) {
            return Err(ChainError::Connect {
                chain: chain.clone(),
                reason: "mock connection refused".into(),
            });
        }
        *state.connections.entry(chain.clone()).or_default() += 1;
        if let Some(relay) = relay {
            state
                .relays_used
                .insert(chain.clone(), relay.chain().clone());
        }
        Ok(Arc::new(MockConnection {
            chain: chain.clone(),
            provider: self.clone(),
        }))
    }
}

struct MockConnection {
    chain: ChainId,
    provider: MockChainProvider,
}

#[async_trait]
impl ChainConnection for MockConnection {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn storage_arity(&self, path: &WatchPath) -> Result<usize, ChainError> {
        self.provider
            .state()
            .arity
            .get(&key(&self.chain, path.as_str()))
            .copied()
            .ok_or_else(|| ChainError::UnknownStorage {
                chain: self.chain.clone(),
                path: path.to_string(),
            })
    }

    async fn subscribe_event(&self, path: &WatchPath) -> Result<FeedStream<RawEvent>, ChainError> {
        let rx = sender(
            &mut self.provider.state().events,
            key(&self.chain, path.as_str()),
        )
        .subscribe();
        self.provider.record(SubscriptionRecord {
            chain: self.chain.clone(),
            path: path.to_string(),
            mode: SubscriptionMode::Event,
            args: Vec::new(),
            at: None,
        });
        Ok(feed(rx))
    }

    async fn subscribe_storage_entries(
        &self,
        path: &WatchPath,
        args: &[Value],
        at: Finality,
    ) -> Result<FeedStream<EntryBatch>, ChainError> {
        let rx = sender(
            &mut self.provider.state().entries,
            key(&self.chain, path.as_str()),
        )
        .subscribe();
        self.provider.record(SubscriptionRecord {
            chain: self.chain.clone(),
            path: path.to_string(),
            mode: SubscriptionMode::Entries,
            args: args.to_vec(),
            at: Some(at),
        });
        Ok(feed(rx))
    }

    async fn subscribe_storage_value(
        &self,
        path: &WatchPath,
        args: &[Value],
        at: Finality,
    ) -> Result<FeedStream<Value>, ChainError> {
        let rx = sender(
            &mut self.provider.state().values,
            key(&self.chain, path.as_str()),
        )
        .subscribe();
        self.provider.record(SubscriptionRecord {
            chain: self.chain.clone(),
            path: path.to_string(),
            mode: SubscriptionMode::Value,
            args: args.to_vec(),
            at: Some(at),
        });
        Ok(feed(rx))
    }
}
