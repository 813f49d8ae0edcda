//! Normalized payloads handed to triggers and lambdas.
//!
//! Every payload carries hidden `__meta` describing the leaf it came from, so a
//! route watching several leaves can tell the shapes apart.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chain::ChainId;
use crate::leaf::WatchLeaf;

pub const META_FIELD: &str = "__meta";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub chain: ChainId,
    pub path: String,
}

impl PayloadMeta {
    pub fn of(leaf: &WatchLeaf) -> Self {
        Self {
            chain: leaf.chain.clone(),
            path: leaf.path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "__meta")]
    pub meta: PayloadMeta,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Payload {
    /// Event payloads are the event's inner value. Non-object values are
    /// placed under `value`.
    pub fn event(leaf: &WatchLeaf, inner: Value) -> Self {
        let body = match inner {
            Value::Object(mut map) => {
                map.remove(META_FIELD);
                map
            }
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Self {
            meta: PayloadMeta::of(leaf),
            body,
        }
    }

    /// Storage payloads are `{ key, value }` where `key` is the full set of
    /// key arguments used to reach the item.
    pub fn storage(leaf: &WatchLeaf, key: Vec<Value>, value: Value) -> Self {
        let mut body = Map::new();
        body.insert("key".into(), Value::Array(key));
        body.insert("value".into(), value);
        Self {
            meta: PayloadMeta::of(leaf),
            body,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    pub fn key(&self) -> Option<&Vec<Value>> {
        self.body.get("key").and_then(Value::as_array)
    }

    pub fn value(&self) -> Option<&Value> {
        self.body.get("value")
    }

    pub fn chain(&self) -> &ChainId {
        &self.meta.chain
    }

    pub fn path(&self) -> &str {
        &self.meta.path
    }
}
