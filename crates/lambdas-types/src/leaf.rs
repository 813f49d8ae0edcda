//! Watch leaves: the atomic unit of subscription intent.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::{ChainId, Finality};

/// First segment of a watch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchRoot {
    Event,
    Storage,
}

impl WatchRoot {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchRoot::Event => "event",
            WatchRoot::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeafError {
    #[error("watch path '{0}' must have at least two segments")]
    TooShort(String),
    #[error("watch path '{0}' has an empty segment")]
    EmptySegment(String),
    #[error("invalid watch path '{path}' on chain '{chain}': must start with \"event\" or \"storage\", found \"{root}\"")]
    InvalidRoot {
        chain: ChainId,
        path: String,
        root: String,
    },
}

/// A validated, dot-separated watch path such as `event.Balances.Transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchPath {
    raw: String,
    root: WatchRoot,
}

impl WatchPath {
    pub fn parse(chain: &ChainId, raw: &str) -> Result<Self, LeafError> {
        let mut segments = raw.split('.');
        let first = segments.next().unwrap_or_default();
        if segments.next().is_none() {
            return Err(LeafError::TooShort(raw.to_string()));
        }
        if raw.split('.').any(str::is_empty) {
            return Err(LeafError::EmptySegment(raw.to_string()));
        }
        let root = match first {
            "event" => WatchRoot::Event,
            "storage" => WatchRoot::Storage,
            other => {
                return Err(LeafError::InvalidRoot {
                    chain: chain.clone(),
                    path: raw.to_string(),
                    root: other.to_string(),
                });
            }
        };
        Ok(Self {
            raw: raw.to_string(),
            root,
        })
    }

    pub fn root(&self) -> WatchRoot {
        self.root
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path segments after the root, e.g. `["Balances", "Transfer"]`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split('.').skip(1)
    }
}

impl fmt::Display for WatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Restrict a storage "watch entries" leaf to one kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Upsert,
    Deleted,
}

/// Per-leaf subscription options.
///
/// An unset `finality` means [`Finality::Finalized`] for both storage modes,
/// single-value leaves included. Leaves that want best blocks must say so
/// with [`LeafOptions::best`]; there is no per-mode implicit `best`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finality: Option<Finality>,
    /// Storage only; ignored for events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
}

impl LeafOptions {
    pub fn best() -> Self {
        Self {
            finality: Some(Finality::Best),
            change_type: None,
        }
    }

    pub fn finalized() -> Self {
        Self {
            finality: Some(Finality::Finalized),
            change_type: None,
        }
    }

    pub fn with_change_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = Some(change_type);
        self
    }

    pub fn finality(&self) -> Finality {
        self.finality.unwrap_or_default()
    }
}

/// One declarative subscription target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchLeaf {
    pub chain: ChainId,
    pub path: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub options: LeafOptions,
}

impl WatchLeaf {
    pub fn event(chain: impl Into<ChainId>, path: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            path: path.into(),
            args: Vec::new(),
            options: LeafOptions::default(),
        }
    }

    pub fn storage(chain: impl Into<ChainId>, path: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            chain: chain.into(),
            path: path.into(),
            args,
            options: LeafOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LeafOptions) -> Self {
        self.options = options;
        self
    }

    pub fn watch_path(&self) -> Result<WatchPath, LeafError> {
        WatchPath::parse(&self.chain, &self.path)
    }
}

impl Eq for WatchLeaf {}

impl Hash for WatchLeaf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chain.hash(state);
        self.path.hash(state);
        self.args.len().hash(state);
        for arg in &self.args {
            arg.to_string().hash(state);
        }
        self.options.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_event_and_storage_roots() {
        let chain = ChainId::from("polkadot");
        let event = WatchPath::parse(&chain, "event.Balances.Transfer").unwrap();
        assert_eq!(event.root(), WatchRoot::Event);
        assert_eq!(event.segments().collect::<Vec<_>>(), vec!["Balances", "Transfer"]);

        let storage = WatchPath::parse(&chain, "storage.System.Account").unwrap();
        assert_eq!(storage.root(), WatchRoot::Storage);
    }

    #[test]
    fn rejects_unknown_root_and_short_paths() {
        let chain = ChainId::from("polkadot");
        assert!(matches!(
            WatchPath::parse(&chain, "query.System.Number"),
            Err(LeafError::InvalidRoot { root, .. }) if root == "query"
        ));
        assert_eq!(
            WatchPath::parse(&chain, "event"),
            Err(LeafError::TooShort("event".into()))
        );
    }

    #[test]
    fn rejects_empty_segments() {
        let chain = ChainId::from("polkadot");
        for raw in ["event.", "storage..Account", ".Balances.Transfer", "event.Balances."] {
            assert_eq!(
                WatchPath::parse(&chain, raw),
                Err(LeafError::EmptySegment(raw.to_string())),
                "{raw}"
            );
        }
        assert!(WatchPath::parse(&chain, "event.Balances.Transfer").is_ok());
    }

    #[test]
    fn unset_finality_is_finalized() {
        assert_eq!(LeafOptions::default().finality(), Finality::Finalized);
        assert_eq!(LeafOptions::best().finality(), Finality::Best);
    }

    #[test]
    fn leaf_wire_shape_is_camel_case() {
        let leaf = WatchLeaf::storage("polkadot", "storage.System.Account", vec![json!("bob")])
            .with_options(LeafOptions::best().with_change_type(ChangeType::Deleted));
        let value = serde_json::to_value(&leaf).unwrap();
        assert_eq!(
            value,
            json!({
                "chain": "polkadot",
                "path": "storage.System.Account",
                "args": ["bob"],
                "options": { "finality": "best", "changeType": "deleted" }
            })
        );
        let back: WatchLeaf = serde_json::from_value(json!({
            "chain": "polkadot",
            "path": "event.Balances.Transfer"
        }))
        .unwrap();
        assert_eq!(back, WatchLeaf::event("polkadot", "event.Balances.Transfer"));
    }

    #[test]
    fn leaves_with_same_args_hash_equal() {
        use std::collections::HashSet;
        let a = WatchLeaf::storage("polkadot", "storage.System.Account", vec![json!({"id": 1})]);
        let b = a.clone();
        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }
}
