use lambdas_types::{Configuration, WatchLeaf};

use crate::route::Route;

/// What an app author ships: configurations plus an ordered list of routes.
/// Route order is significant; remote payloads address routes by index.
#[derive(Debug, Clone, Default)]
pub struct AppModule {
    pub configurations: Vec<Configuration>,
    pub routes: Vec<Route>,
}

impl AppModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, configuration: Configuration) -> Self {
        self.configurations.push(configuration);
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Watch leaves grouped by route index, as sent in `register`.
    pub fn observed_leaves(&self) -> Vec<Vec<WatchLeaf>> {
        self.routes.iter().map(|r| r.watching().to_vec()).collect()
    }

    /// Last non-empty `Info` description, trimmed.
    pub fn description(&self) -> Option<String> {
        self.configurations.iter().rev().find_map(|c| match c {
            Configuration::Info {
                description: Some(d),
            } if !d.trim().is_empty() => Some(d.trim().to_string()),
            _ => None,
        })
    }
}
