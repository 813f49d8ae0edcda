//! Typed caller-side stubs. Each stub can only name methods from the remote
//! side's method table.

use std::marker::PhantomData;

use lambdas_types::{Configuration, Payload, Settings, WatchLeaf};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;
use crate::methods::{AppMethod, HostMethod, MethodSet};
use crate::peer::Caller;

/// Calls restricted to the method set `M` served by the remote side.
pub struct Away<M: MethodSet> {
    caller: Caller,
    _methods: PhantomData<M>,
}

impl<M: MethodSet> Clone for Away<M> {
    fn clone(&self) -> Self {
        Self {
            caller: self.caller.clone(),
            _methods: PhantomData,
        }
    }
}

impl<M: MethodSet> Away<M> {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            _methods: PhantomData,
        }
    }

    pub async fn call(&self, method: M, params: Vec<Value>) -> Result<Value, RpcError> {
        self.caller.call(method.name(), params).await
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: M,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }
}

/// The host as seen from an app.
#[derive(Clone)]
pub struct HostAway(Away<HostMethod>);

impl HostAway {
    pub fn new(caller: Caller) -> Self {
        Self(Away::new(caller))
    }

    /// Register the app's configurations and its watch leaves grouped by
    /// route index. Returns the resolved settings.
    pub async fn register(
        &self,
        configurations: &[Configuration],
        observed: &[Vec<WatchLeaf>],
    ) -> Result<Settings, RpcError> {
        let params = vec![
            serde_json::to_value(configurations)?,
            serde_json::to_value(observed)?,
        ];
        self.0.call_as(HostMethod::Register, params).await
    }
}

/// A sandboxed app as seen from the host.
#[derive(Clone)]
pub struct AppAway(Away<AppMethod>);

impl AppAway {
    pub fn new(caller: Caller) -> Self {
        Self(Away::new(caller))
    }

    pub async fn push_payload(&self, route_index: usize, payload: &Payload) -> Result<(), RpcError> {
        let params = vec![Value::from(route_index), serde_json::to_value(payload)?];
        self.0.call(AppMethod::PushPayload, params).await.map(|_| ())
    }

    pub async fn set_settings(&self, settings: &Settings) -> Result<(), RpcError> {
        let params = vec![serde_json::to_value(settings)?];
        self.0.call(AppMethod::SetSettings, params).await.map(|_| ())
    }

    pub fn is_closed(&self) -> bool {
        self.0.caller().is_closed()
    }
}
