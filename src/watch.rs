//! Watch supervision: list+watch sessions, restart, backoff
//!
//! Each watched resource gets one supervision loop. Opening the very first
//! session is synchronous with startup and fatal on failure: a device that
//! cannot establish its foundational watches cannot do its job, and crashing
//! early is more honest than running blind. After that, a closed or errored
//! transport is routine: the loop re-opens a session under capped, jittered
//! backoff and keeps feeding the same handler.
//!
//! Handler failures never tear a watch down. The handler is the engine, and
//! a cycle that failed this event will be retried by the next one; the watch
//! just keeps delivering.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchParams};
use kube::core::WatchEvent;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A change observed on a watched resource
#[derive(Clone, Debug)]
pub enum WatchDelta<K> {
    /// The object exists with this content (added or modified)
    Applied(K),
    /// The object was deleted
    Deleted(K),
}

/// Consumer of watch deltas
#[async_trait]
pub trait EventHandler<K>: Send + Sync {
    /// Handle one delta; errors are logged by the manager, never fatal
    async fn handle(&self, delta: WatchDelta<K>) -> crate::Result<()>;
}

/// One open list+watch session
pub struct WatchSession<K> {
    /// Objects present when the session opened
    pub initial: Vec<K>,
    /// Deltas observed after the initial list
    pub deltas: BoxStream<'static, crate::Result<WatchDelta<K>>>,
}

/// Source of watch sessions
///
/// Separating session opening from consumption is what makes restart
/// behavior testable: the manager goes back to the same source every
/// time the transport drops.
#[async_trait]
pub trait WatchSource<K>: Send + Sync {
    /// List current objects and open a watch from that point
    async fn open(&self) -> crate::Result<WatchSession<K>>;
}

/// Restart backoff: exponential, capped, jittered
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first restart attempt
    pub initial: Duration,
    /// Upper bound on the delay between attempts
    pub max: Duration,
    /// Growth factor applied after each failed attempt
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    fn next(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.multiplier);
        grown.min(self.max)
    }

    /// Spread restarts out so a fleet sharing one API server does not
    /// reconnect in lockstep.
    fn jittered(&self, delay: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        delay.mul_f64(factor).min(self.max)
    }
}

/// Supervises one watch from first open to shutdown
pub struct WatchManager<K> {
    watch: &'static str,
    source: Arc<dyn WatchSource<K>>,
    handler: Arc<dyn EventHandler<K>>,
    backoff: BackoffPolicy,
}

impl<K: Send + 'static> WatchManager<K> {
    /// Create a manager wiring the source to the handler
    ///
    /// `watch` names this watch in log records.
    pub fn new(
        watch: &'static str,
        source: Arc<dyn WatchSource<K>>,
        handler: Arc<dyn EventHandler<K>>,
    ) -> Self {
        Self {
            watch,
            source,
            handler,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Override the restart backoff
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Open the first session and spawn the supervision loop.
    ///
    /// The first open failing is fatal and propagates; every later failure
    /// is absorbed by the loop.
    pub async fn start(self, token: CancellationToken) -> crate::Result<JoinHandle<()>> {
        let session = self.source.open().await?;
        info!(watch = self.watch, initial = session.initial.len(), "watch open");
        Ok(tokio::spawn(async move { self.run(session, token).await }))
    }

    async fn run(self, first: WatchSession<K>, token: CancellationToken) {
        let mut session = first;
        let mut delay = self.backoff.initial;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.consume(session) => {}
            }

            warn!(watch = self.watch, "watch stream closed, restarting");
            session = loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(self.backoff.jittered(delay)) => {}
                }
                match self.source.open().await {
                    Ok(session) => {
                        info!(
                            watch = self.watch,
                            initial = session.initial.len(),
                            "watch re-opened"
                        );
                        delay = self.backoff.initial;
                        break session;
                    }
                    Err(error) => {
                        warn!(watch = self.watch, %error, "watch re-open failed");
                        delay = self.backoff.next(delay);
                    }
                }
            };
        }
        info!(watch = self.watch, "watch stopped");
    }

    /// Feed one session to the handler until its stream ends.
    async fn consume(&self, session: WatchSession<K>) {
        let WatchSession { initial, mut deltas } = session;

        for obj in initial {
            self.dispatch(WatchDelta::Applied(obj)).await;
        }
        while let Some(item) = deltas.next().await {
            match item {
                Ok(delta) => self.dispatch(delta).await,
                Err(error) => {
                    // an errored transport is a closed transport
                    warn!(watch = self.watch, %error, "watch transport error");
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, delta: WatchDelta<K>) {
        if let Err(error) = self.handler.handle(delta).await {
            error!(watch = self.watch, %error, "event handler failed");
        }
    }
}

/// Watch source backed by a typed namespaced API
pub struct KubeWatchSource<K> {
    api: Api<K>,
    labels: Option<String>,
}

impl<K> KubeWatchSource<K> {
    /// Watch every object the API serves
    pub fn new(api: Api<K>) -> Self {
        Self { api, labels: None }
    }

    /// Watch only objects matching the label selector
    pub fn with_labels(api: Api<K>, selector: impl Into<String>) -> Self {
        Self {
            api,
            labels: Some(selector.into()),
        }
    }
}

#[async_trait]
impl<K> WatchSource<K> for KubeWatchSource<K>
where
    K: Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    async fn open(&self) -> crate::Result<WatchSession<K>> {
        let mut list_params = ListParams::default();
        if let Some(labels) = &self.labels {
            list_params = list_params.labels(labels);
        }
        let list = self.api.list(&list_params).await?;
        let version = list.metadata.resource_version.unwrap_or_default();

        let mut watch_params = WatchParams::default();
        if let Some(labels) = &self.labels {
            watch_params = watch_params.labels(labels);
        }
        let events = self.api.watch(&watch_params, &version).await?;

        let deltas = events
            .filter_map(|item| async move {
                match item {
                    Ok(WatchEvent::Added(obj)) | Ok(WatchEvent::Modified(obj)) => {
                        Some(Ok(WatchDelta::Applied(obj)))
                    }
                    Ok(WatchEvent::Deleted(obj)) => Some(Ok(WatchDelta::Deleted(obj))),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    // API-level error events are logged and skipped; if the
                    // stream is actually broken it will end and restart
                    Ok(WatchEvent::Error(e)) => {
                        error!(code = e.code, reason = %e.reason, "watch error event");
                        None
                    }
                    Err(e) => Some(Err(crate::Error::from(e))),
                }
            })
            .boxed();

        Ok(WatchSession {
            initial: list.items,
            deltas,
        })
    }
}
