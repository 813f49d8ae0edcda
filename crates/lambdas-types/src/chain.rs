//! Chain identifiers and the connection provider consumed by the host.
//!
//! The provider is an opaque source of live feeds: "subscribe to X, get values
//! of Y". Everything about how a connection is established (light client, RPC
//! node, fixture) lives behind [`ChainProvider`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::leaf::WatchPath;

/// Opaque chain identifier, e.g. `polkadot` or `polkadot_asset_hub`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChainId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether `chain` is itself one of the known relay chains.
pub fn is_relay(chain: &ChainId, relays: &[ChainId]) -> bool {
    relays.contains(chain)
}

/// Relay chain a given chain hangs off. Relay ids prefix their parachain ids.
pub fn relay_of<'a>(chain: &ChainId, relays: &'a [ChainId]) -> Result<&'a ChainId, ChainError> {
    relays
        .iter()
        .find(|relay| chain.as_str().starts_with(relay.as_str()))
        .ok_or_else(|| ChainError::UnknownRelay(chain.clone()))
}

/// Block state a storage observation reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finality {
    Best,
    #[default]
    Finalized,
}

impl Finality {
    pub fn as_str(self) -> &'static str {
        match self {
            Finality::Best => "best",
            Finality::Finalized => "finalized",
        }
    }
}

/// One emission of a raw event feed. `payload` is the event's inner value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<Value>,
}

impl RawEvent {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            block: None,
        }
    }
}

/// A single storage entry: the full key arguments and the current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub args: Vec<Value>,
    pub value: Value,
}

/// Changes since the previous batch of a "watch entries" feed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Deltas {
    #[serde(default)]
    pub deleted: Vec<StorageEntry>,
    #[serde(default)]
    pub upserted: Vec<StorageEntry>,
}

/// One emission of a "watch entries" feed. `deltas` is `None` on the first
/// batch, which carries the full snapshot in `entries`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<Value>,
    #[serde(default)]
    pub deltas: Option<Deltas>,
    #[serde(default)]
    pub entries: Vec<StorageEntry>,
}

pub type FeedStream<T> = BoxStream<'static, T>;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no relay found for chain '{0}'")]
    UnknownRelay(ChainId),
    #[error("failed to connect to chain '{chain}': {reason}")]
    Connect { chain: ChainId, reason: String },
    #[error("unknown storage item '{path}' on chain '{chain}'")]
    UnknownStorage { chain: ChainId, path: String },
    #[error("subscription to '{path}' on chain '{chain}' failed: {reason}")]
    Subscribe {
        chain: ChainId,
        path: String,
        reason: String,
    },
}

/// A live, shareable handle to one chain.
#[async_trait]
pub trait ChainConnection: Send + Sync {
    fn chain(&self) -> &ChainId;

    /// Number of key arguments the storage item at `path` requires.
    async fn storage_arity(&self, path: &WatchPath) -> Result<usize, ChainError>;

    async fn subscribe_event(&self, path: &WatchPath) -> Result<FeedStream<RawEvent>, ChainError>;

    async fn subscribe_storage_entries(
        &self,
        path: &WatchPath,
        args: &[Value],
        at: Finality,
    ) -> Result<FeedStream<EntryBatch>, ChainError>;

    async fn subscribe_storage_value(
        &self,
        path: &WatchPath,
        args: &[Value],
        at: Finality,
    ) -> Result<FeedStream<Value>, ChainError>;
}

/// Establishes chain connections. Parachains receive their relay's
/// already-established connection.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn connect(
        &self,
        chain: &ChainId,
        relay: Option<Arc<dyn ChainConnection>>,
    ) -> Result<Arc<dyn ChainConnection>, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relays() -> Vec<ChainId> {
        vec!["polkadot".into(), "kusama".into()]
    }

    #[test]
    fn relay_lookup_uses_prefix() {
        let relays = relays();
        let relay = relay_of(&"polkadot_asset_hub".into(), &relays).unwrap();
        assert_eq!(relay.as_str(), "polkadot");
        assert!(is_relay(&"kusama".into(), &relays));
        assert!(!is_relay(&"kusama_people".into(), &relays));
    }

    #[test]
    fn unknown_relay_is_an_error() {
        let err = relay_of(&"westend".into(), &relays()).unwrap_err();
        assert!(matches!(err, ChainError::UnknownRelay(id) if id.as_str() == "westend"));
    }

    #[test]
    fn finality_defaults_to_finalized() {
        assert_eq!(Finality::default(), Finality::Finalized);
        assert_eq!(Finality::Best.as_str(), "best");
    }
}
