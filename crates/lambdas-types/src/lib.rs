//! Shared data model for the lambdas runtime: chains, watch leaves, payloads
//! and app configurations, plus the chain connection traits consumed by the host.

pub mod chain;
pub mod config;
pub mod leaf;
pub mod payload;

pub use chain::{
    ChainConnection, ChainError, ChainId, ChainProvider, Deltas, EntryBatch, FeedStream,
    Finality, RawEvent, StorageEntry, is_relay, relay_of,
};
pub use config::{
    Configuration, FieldType, Permission, SettingError, Settings, coerce_raw_setting,
};
pub use leaf::{ChangeType, LeafError, LeafOptions, WatchLeaf, WatchPath, WatchRoot};
pub use payload::{META_FIELD, Payload, PayloadMeta};
