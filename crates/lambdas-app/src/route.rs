//! Routes bind watch leaves to a trigger predicate and a lambda action.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lambdas_types::{Payload, WatchLeaf};

use crate::context::Context;

#[async_trait]
pub trait Trigger: Send + Sync {
    async fn evaluate(&self, payload: &Payload, context: &Context) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait Lambda: Send + Sync {
    async fn run(&self, payload: Payload, context: Context) -> anyhow::Result<()>;
}

struct FnTrigger<F>(F);

#[async_trait]
impl<F> Trigger for FnTrigger<F>
where
    F: Fn(&Payload, &Context) -> anyhow::Result<bool> + Send + Sync,
{
    async fn evaluate(&self, payload: &Payload, context: &Context) -> anyhow::Result<bool> {
        (self.0)(payload, context)
    }
}

struct AsyncFnTrigger<F>(F);

#[async_trait]
impl<F, Fut> Trigger for AsyncFnTrigger<F>
where
    F: Fn(Payload, Context) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn evaluate(&self, payload: &Payload, context: &Context) -> anyhow::Result<bool> {
        (self.0)(payload.clone(), context.clone()).await
    }
}

struct FnLambda<F>(F);

#[async_trait]
impl<F, Fut> Lambda for FnLambda<F>
where
    F: Fn(Payload, Context) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, payload: Payload, context: Context) -> anyhow::Result<()> {
        (self.0)(payload, context).await
    }
}

struct Always;

#[async_trait]
impl Trigger for Always {
    async fn evaluate(&self, _payload: &Payload, _context: &Context) -> anyhow::Result<bool> {
        Ok(true)
    }
}

struct Noop;

#[async_trait]
impl Lambda for Noop {
    async fn run(&self, _payload: Payload, _context: Context) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An immutable watch/trigger/lambda binding. Every leaf's payload shape is
/// accepted by the same trigger and lambda.
#[derive(Clone)]
pub struct Route {
    watching: Vec<WatchLeaf>,
    trigger: Arc<dyn Trigger>,
    lambda: Arc<dyn Lambda>,
}

impl Route {
    pub fn builder(watching: impl IntoIterator<Item = WatchLeaf>) -> RouteBuilder {
        RouteBuilder {
            watching: watching.into_iter().collect(),
            trigger: Arc::new(Always),
            lambda: Arc::new(Noop),
        }
    }

    pub fn watching(&self) -> &[WatchLeaf] {
        &self.watching
    }

    pub fn trigger(&self) -> &Arc<dyn Trigger> {
        &self.trigger
    }

    pub fn lambda(&self) -> &Arc<dyn Lambda> {
        &self.lambda
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("watching", &self.watching)
            .finish_non_exhaustive()
    }
}

/// Builds a [`Route`]. Without an explicit trigger every payload fires the
/// lambda; without a lambda firing is a no-op.
pub struct RouteBuilder {
    watching: Vec<WatchLeaf>,
    trigger: Arc<dyn Trigger>,
    lambda: Arc<dyn Lambda>,
}

impl RouteBuilder {
    pub fn trigger<F>(mut self, f: F) -> Self
    where
        F: Fn(&Payload, &Context) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.trigger = Arc::new(FnTrigger(f));
        self
    }

    pub fn trigger_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Payload, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.trigger = Arc::new(AsyncFnTrigger(f));
        self
    }

    pub fn lambda<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Payload, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.lambda = Arc::new(FnLambda(f));
        self
    }

    pub fn with_trigger(mut self, trigger: impl Trigger + 'static) -> Self {
        self.trigger = Arc::new(trigger);
        self
    }

    pub fn with_lambda(mut self, lambda: impl Lambda + 'static) -> Self {
        self.lambda = Arc::new(lambda);
        self
    }

    pub fn build(self) -> Route {
        Route {
            watching: self.watching,
            trigger: self.trigger,
            lambda: self.lambda,
        }
    }
}
