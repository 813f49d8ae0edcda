//! Applies a route's trigger/lambda contract to one payload.
//!
//! Failures (an `Err` or a panic) in either function are caught here, logged
//! against the owning app, and never reach the subscription feeding us.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use lambdas_types::Payload;
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::route::Route;

/// Receives evaluation failure messages for an app's log trail.
pub type LogSink = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct Evaluator {
    app: Arc<str>,
    log: Option<LogSink>,
}

impl Evaluator {
    pub fn new(app: impl Into<Arc<str>>) -> Self {
        Self {
            app: app.into(),
            log: None,
        }
    }

    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = Some(log);
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Evaluate `route`'s trigger against `payload` on a fresh task. When it
    /// yields `true` the lambda is spawned and not awaited, so lambdas for the
    /// same route may overlap. The returned handle completes once the trigger
    /// has been decided.
    pub fn process(&self, route: &Route, payload: Payload, context: Context) -> JoinHandle<()> {
        let trigger = route.trigger().clone();
        let lambda = route.lambda().clone();
        let this = self.clone();
        tokio::spawn(async move {
            let decided = AssertUnwindSafe(trigger.evaluate(&payload, &context))
                .catch_unwind()
                .await;
            match decided {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return,
                Ok(Err(e)) => {
                    this.report("trigger", payload.path(), &format!("{e:#}"));
                    return;
                }
                Err(_) => {
                    this.report("trigger", payload.path(), "panicked");
                    return;
                }
            }

            let this = this.clone();
            tokio::spawn(async move {
                let path = payload.path().to_string();
                let ran = AssertUnwindSafe(lambda.run(payload, context))
                    .catch_unwind()
                    .await;
                match ran {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => this.report("lambda", &path, &format!("{e:#}")),
                    Err(_) => this.report("lambda", &path, "panicked"),
                }
            });
        })
    }

    fn report(&self, stage: &str, path: &str, detail: &str) {
        tracing::warn!(app = %self.app, %stage, %path, %detail, "evaluation failed");
        if let Some(log) = &self.log {
            log(format!("{stage} failed for {path}: {detail}"));
        }
    }
}
