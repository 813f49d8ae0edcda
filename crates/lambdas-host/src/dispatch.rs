//! Watch-leaf dispatcher.
//!
//! Turns one leaf plus a chain handle into one live feed of normalized
//! payloads, and drives that feed into a sink on its own task.

use futures::stream::{self, StreamExt};
use lambdas_app::{Context, Evaluator, Route};
use lambdas_rpc::{AppAway, RpcError};
use lambdas_types::{
    ChainConnection, ChangeType, EntryBatch, FeedStream, Payload, StorageEntry, WatchLeaf,
    WatchRoot,
};
use tokio::task::JoinHandle;

use crate::error::HostError;

pub type PayloadFeed = FeedStream<Payload>;

/// Validate `leaf` and subscribe to it. The path is checked before the chain
/// is asked for anything, so an invalid root never opens a subscription.
///
/// Storage leaves with fewer arguments than the item's key arity watch every
/// matching entry; otherwise the single value at `args` is watched.
pub async fn open_feed(conn: &dyn ChainConnection, leaf: &WatchLeaf) -> Result<PayloadFeed, HostError> {
    let path = leaf.watch_path()?;
    let leaf = leaf.clone();
    match path.root() {
        WatchRoot::Event => {
            let events = conn.subscribe_event(&path).await?;
            Ok(events
                .map(move |event| Payload::event(&leaf, event.payload))
                .boxed())
        }
        WatchRoot::Storage => {
            let arity = conn.storage_arity(&path).await?;
            let at = leaf.options.finality();
            if leaf.args.len() < arity {
                let batches = conn.subscribe_storage_entries(&path, &leaf.args, at).await?;
                let filter = leaf.options.change_type;
                Ok(batches
                    .flat_map(move |batch| {
                        let payloads: Vec<Payload> = select_entries(batch, filter)
                            .into_iter()
                            .map(|entry| Payload::storage(&leaf, entry.args, entry.value))
                            .collect();
                        stream::iter(payloads)
                    })
                    .boxed())
            } else {
                let values = conn.subscribe_storage_value(&path, &leaf.args, at).await?;
                Ok(values
                    .map(move |value| Payload::storage(&leaf, leaf.args.clone(), value))
                    .boxed())
            }
        }
    }
}

/// Entries of `batch` that pass the change-type filter. The first batch of a
/// feed carries no deltas; it is a snapshot in which every entry is new.
fn select_entries(batch: EntryBatch, filter: Option<ChangeType>) -> Vec<StorageEntry> {
    match (filter, batch.deltas) {
        (None, _) => batch.entries,
        (Some(ChangeType::Upsert), Some(deltas)) => deltas.upserted,
        (Some(ChangeType::Deleted), Some(deltas)) => deltas.deleted,
        (Some(ChangeType::Upsert), None) => batch.entries,
        (Some(ChangeType::Deleted), None) => Vec::new(),
    }
}

/// Where a subscription's payloads go.
#[derive(Clone)]
pub enum Sink {
    /// Evaluate in this process.
    Local {
        evaluator: Evaluator,
        route: Route,
        context: Context,
    },
    /// Forward to a sandboxed app, addressed by route index.
    Remote { app: AppAway, route_index: usize },
}

impl Sink {
    /// Hand one payload on. Returns `false` once the sink can never accept
    /// another payload.
    pub async fn deliver(&self, payload: Payload) -> bool {
        match self {
            Sink::Local {
                evaluator,
                route,
                context,
            } => {
                drop(evaluator.process(route, payload, context.clone()));
                true
            }
            Sink::Remote { app, route_index } => {
                match app.push_payload(*route_index, &payload).await {
                    Ok(()) => true,
                    Err(RpcError::Closed) => false,
                    Err(e) => {
                        tracing::warn!(
                            route = route_index,
                            path = payload.path(),
                            error = %e,
                            "pushPayload failed"
                        );
                        true
                    }
                }
            }
        }
    }
}

/// A live feed task. Cancelling detaches the owner's interest; the chain
/// connection it was opened on is untouched.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Drive `feed` into `sink` in emission order. `on_end` runs when the feed
/// finishes or the sink goes away, never when the subscription is cancelled.
pub fn spawn_feed<F>(id: u64, mut feed: PayloadFeed, sink: Sink, on_end: F) -> Subscription
where
    F: FnOnce() + Send + 'static,
{
    let task = tokio::spawn(async move {
        while let Some(payload) = feed.next().await {
            if !sink.deliver(payload).await {
                break;
            }
        }
        on_end();
    });
    Subscription { id, task }
}
