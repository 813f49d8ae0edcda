use std::path::PathBuf;
use std::time::Duration;

use lambdas_types::ChainId;

pub const ENV_LISTEN_ADDR: &str = "LAMBDAS_LISTEN_ADDR";
pub const ENV_SETTINGS_DB: &str = "LAMBDAS_SETTINGS_DB";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Where the sandboxed-app channel listens. Port 0 picks a free port.
    pub listen_addr: String,
    /// Known relay chains; parachain ids are prefixed by their relay's id.
    pub relay_chains: Vec<ChainId>,
    /// Optional sqlite file for persisted settings.
    pub settings_db: Option<PathBuf>,
    /// How long a new connection may take to present its session token.
    pub register_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7001".into(),
            relay_chains: ["polkadot", "kusama", "westend", "paseo"]
                .into_iter()
                .map(ChainId::from)
                .collect(),
            settings_db: None,
            register_timeout: Duration::from_secs(10),
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `LAMBDAS_LISTEN_ADDR` and `LAMBDAS_SETTINGS_DB`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(ENV_LISTEN_ADDR) {
            config.listen_addr = addr;
        }
        if let Ok(path) = std::env::var(ENV_SETTINGS_DB) {
            config.settings_db = Some(PathBuf::from(path));
        }
        config
    }

    pub fn with_relays<I, C>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ChainId>,
    {
        self.relay_chains = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }
}
