//! One connection per chain, created on first use and shared by every app.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use lambdas_types::{ChainConnection, ChainError, ChainId, ChainProvider, is_relay, relay_of};
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<Arc<dyn ChainConnection>>>;

pub struct ChainRegistry {
    provider: Arc<dyn ChainProvider>,
    relays: Vec<ChainId>,
    slots: Mutex<HashMap<ChainId, Slot>>,
}

impl ChainRegistry {
    pub fn new(provider: Arc<dyn ChainProvider>, relays: Vec<ChainId>) -> Self {
        Self {
            provider,
            relays,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn relays(&self) -> &[ChainId] {
        &self.relays
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ChainId, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, chain: &ChainId) -> Slot {
        self.slots().entry(chain.clone()).or_default().clone()
    }

    /// Connection for `chain`, establishing it if absent. A parachain's relay
    /// is connected first and handed to the provider. Concurrent first use
    /// waits on the same in-flight connect; a failed connect is retried by
    /// the next caller.
    pub async fn connect(&self, chain: &ChainId) -> Result<Arc<dyn ChainConnection>, ChainError> {
        let relay = if is_relay(chain, &self.relays) {
            None
        } else {
            let relay_id = relay_of(chain, &self.relays)?.clone();
            Some(self.establish(&relay_id, None).await?)
        };
        self.establish(chain, relay).await
    }

    async fn establish(
        &self,
        chain: &ChainId,
        relay: Option<Arc<dyn ChainConnection>>,
    ) -> Result<Arc<dyn ChainConnection>, ChainError> {
        let slot = self.slot(chain);
        let conn = slot
            .get_or_try_init(move || async move {
                tracing::info!(%chain, relay = relay.is_some(), "connecting to chain");
                self.provider.connect(chain, relay).await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Already-established connection, if any.
    pub fn get(&self, chain: &ChainId) -> Option<Arc<dyn ChainConnection>> {
        self.slots().get(chain).and_then(|slot| slot.get().cloned())
    }

    /// Connect every chain in `chains` and return them keyed by id.
    pub async fn connect_all<'a>(
        &self,
        chains: impl IntoIterator<Item = &'a ChainId>,
    ) -> Result<BTreeMap<ChainId, Arc<dyn ChainConnection>>, ChainError> {
        let mut out = BTreeMap::new();
        for chain in chains {
            out.insert(chain.clone(), self.connect(chain).await?);
        }
        Ok(out)
    }

    pub fn connected(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::MockChainProvider;

    fn registry(provider: &MockChainProvider) -> ChainRegistry {
        ChainRegistry::new(Arc::new(provider.clone()), vec!["c1".into()])
    }

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let provider = MockChainProvider::new();
        let registry = Arc::new(registry(&provider));
        let chain = ChainId::from("c1");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let chain = chain.clone();
                tokio::spawn(async move { registry.connect(&chain).await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(provider.connection_count(&chain), 1);
    }

    #[tokio::test]
    async fn parachain_reuses_established_relay() {
        let provider = MockChainProvider::new();
        let registry = registry(&provider);

        registry.connect(&"c1".into()).await.unwrap();
        registry.connect(&"c1_assets".into()).await.unwrap();

        assert_eq!(provider.connection_count(&"c1".into()), 1);
        assert_eq!(provider.connection_count(&"c1_assets".into()), 1);
        assert_eq!(
            provider.relay_used_by(&"c1_assets".into()),
            Some(ChainId::from("c1"))
        );
        assert_eq!(
            registry.connected(),
            vec![ChainId::from("c1"), ChainId::from("c1_assets")]
        );
    }

    #[tokio::test]
    async fn chain_without_relay_is_refused() {
        let provider = MockChainProvider::new();
        let err = registry(&provider).connect(&"zz".into()).await.err().unwrap();
        assert!(matches!(err, ChainError::UnknownRelay(_)));
        assert_eq!(provider.connection_count(&"zz".into()), 0);
    }
}
