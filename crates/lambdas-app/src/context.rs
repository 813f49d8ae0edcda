use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use lambdas_types::{ChainConnection, ChainId, Settings};
use serde_json::Value;

/// Value passed to every trigger and lambda call: the chains the app uses and
/// its resolved settings. Cloning is cheap.
#[derive(Clone, Default)]
pub struct Context {
    chains: Arc<BTreeMap<ChainId, Arc<dyn ChainConnection>>>,
    settings: Arc<Settings>,
}

impl Context {
    pub fn new(chains: BTreeMap<ChainId, Arc<dyn ChainConnection>>, settings: Settings) -> Self {
        Self {
            chains: Arc::new(chains),
            settings: Arc::new(settings),
        }
    }

    pub fn chain(&self, id: &ChainId) -> Option<&Arc<dyn ChainConnection>> {
        self.chains.get(id)
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = &ChainId> {
        self.chains.keys()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn setting(&self, field: &str) -> Option<&Value> {
        self.settings.get(field)
    }

    /// Same chains, new settings.
    pub fn with_settings(&self, settings: Settings) -> Self {
        Self {
            chains: self.chains.clone(),
            settings: Arc::new(settings),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("chains", &self.chains.keys().collect::<Vec<_>>())
            .field("settings", &self.settings.keys().collect::<Vec<_>>())
            .finish()
    }
}
