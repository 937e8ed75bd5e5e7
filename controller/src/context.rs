use crate::backoff::Backoff;
use crate::config::Config;
use crate::errors::{ObjectId, ReconcileError, ReconcileResult};
use crate::k8s::ClusterTracker;
use crate::metrics::{result_label, RECONCILE_COUNTER, RECONCILE_DURATION};
use anyhow::anyhow;
use futures::{Future, Stream, StreamExt};
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::Resource;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// State shared by every controller running in the process.
#[derive(Clone)]
pub struct Context {
    pub client: kube::Client,
    pub tracker: ClusterTracker,
    pub config: Arc<Config>,
}

impl Context {
    pub fn new(client: kube::Client, config: Config) -> Self {
        Self {
            client,
            tracker: ClusterTracker::new(),
            config: Arc::new(config),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        self.config.runtime.remote_timeout()
    }

    /// A fresh backoff tracker. Each controller owns one, since object keys
    /// of different kinds may collide.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.config.runtime.retry_base_delay.into(),
            self.config.runtime.retry_max_delay.into(),
        )
    }

    pub fn controller_config(&self) -> controller::Config {
        controller::Config::default().concurrency(self.config.runtime.max_concurrent_reconciles)
    }
}

/// Shared requeue policy. Terminal errors wait for the object to change,
/// everything else backs off per object.
pub fn error_policy<K>(
    controller: &'static str,
    backoff: &Backoff,
    obj: &K,
    err: &ReconcileError,
) -> Action
where
    K: Resource,
{
    let object = ObjectId::of(obj);
    if err.is_terminal() {
        warn!(controller, %object, "{err}");
        backoff.reset(object.as_str());
        Action::await_change()
    } else {
        let delay = backoff.next(object.as_str());
        warn!(controller, %object, retry_in = ?delay, "{err}");
        Action::requeue(delay)
    }
}

/// Runs one reconcile, recording metrics and clearing backoff on success.
pub async fn observe<F>(
    controller: &'static str,
    backoff: &Backoff,
    object: &ObjectId,
    reconcile: F,
) -> ReconcileResult<Action>
where
    F: Future<Output = ReconcileResult<Action>>,
{
    let timer = RECONCILE_DURATION
        .with_label_values(&[controller])
        .start_timer();
    let result = reconcile.await;
    timer.observe_duration();
    RECONCILE_COUNTER
        .with_label_values(&[controller, result_label(&result)])
        .inc();
    if result.is_ok() {
        backoff.reset(object.as_str());
    }
    result
}

/// Bounds a remote call. The call is dropped once the timeout passes.
pub async fn with_timeout<T, E, F>(timeout: Duration, call: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(anyhow!("timed out after {timeout:?}")),
    }
}

/// Drives a controller stream to completion.
pub async fn drain<K, S>(controller: &'static str, stream: S)
where
    K: Resource,
    K::DynamicType: std::fmt::Debug,
    S: Stream<
        Item = Result<
            (ObjectRef<K>, Action),
            controller::Error<ReconcileError, watcher::Error>,
        >,
    >,
{
    stream
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => debug!(controller, %object, ?action, "reconciled"),
                Err(err) => debug!(controller, "reconcile failed: {err}"),
            }
        })
        .await
}
