//! Wiring: one place that builds the tracker, drainer, watcher and layer.
//!
//! ```rust
//! use bucketgate::{AdmissionControl, Bucket, InMemoryConfigSource, PriorityBand};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let source = Arc::new(InMemoryConfigSource::new());
//! source.apply_bucket(Bucket::new("system", PriorityBand::Top).with_reserved_quota(10));
//!
//! let control = AdmissionControl::builder(source).build();
//! let tasks = control.spawn();
//! let _layer = control.layer();
//! tasks.abort();
//! # }
//! ```

use crate::config::AdmissionConfig;
use crate::drainer::QueueDrainer;
use crate::filter::AdmissionLayer;
use crate::quota::QuotaTracker;
use crate::snapshot::{ConfigSnapshot, LiveSnapshot};
use crate::source::ConfigSource;
use crate::telemetry::{NullSink, TelemetrySink};
use crate::watcher::ConfigWatcher;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A fully wired admission controller.
pub struct AdmissionControl<C, K = NullSink> {
    config: AdmissionConfig,
    drainer: Arc<QueueDrainer<K>>,
    watcher: Arc<ConfigWatcher<C, K>>,
}

/// Background tasks started by [`AdmissionControl::spawn`].
#[derive(Debug)]
pub struct AdmissionTasks {
    pub drainer: JoinHandle<()>,
    pub watcher: JoinHandle<()>,
}

impl AdmissionTasks {
    /// Stop both tasks. Requests still waiting will time out.
    pub fn abort(&self) {
        self.drainer.abort();
        self.watcher.abort();
    }
}

impl<C: ConfigSource> AdmissionControl<C, NullSink> {
    pub fn builder(source: Arc<C>) -> AdmissionControlBuilder<C, NullSink> {
        AdmissionControlBuilder::new(source)
    }
}

impl<C, K> AdmissionControl<C, K>
where
    C: ConfigSource,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn drainer(&self) -> &Arc<QueueDrainer<K>> {
        &self.drainer
    }

    pub fn watcher(&self) -> &Arc<ConfigWatcher<C, K>> {
        &self.watcher
    }

    /// A tower layer admitting requests through this controller.
    pub fn layer(&self) -> AdmissionLayer<K> {
        AdmissionLayer::new(self.drainer.clone(), &self.config)
    }

    /// Start the drainer loop and the config watcher on the current runtime.
    pub fn spawn(&self) -> AdmissionTasks {
        AdmissionTasks {
            drainer: tokio::spawn(self.drainer.clone().run()),
            watcher: tokio::spawn(self.watcher.clone().run()),
        }
    }
}

/// Builder for [`AdmissionControl`].
pub struct AdmissionControlBuilder<C, K = NullSink> {
    source: Arc<C>,
    config: AdmissionConfig,
    sink: K,
}

impl<C: ConfigSource> AdmissionControlBuilder<C, NullSink> {
    pub fn new(source: Arc<C>) -> Self {
        Self { source, config: AdmissionConfig::default(), sink: NullSink }
    }
}

impl<C, K> AdmissionControlBuilder<C, K>
where
    C: ConfigSource,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    pub fn config(mut self, config: AdmissionConfig) -> Self {
        self.config = config;
        self
    }

    /// Send admission events to `sink` instead of discarding them.
    pub fn sink<K2>(self, sink: K2) -> AdmissionControlBuilder<C, K2>
    where
        K2: TelemetrySink,
        K2::Future: Send + 'static,
    {
        AdmissionControlBuilder { source: self.source, config: self.config, sink }
    }

    pub fn build(self) -> AdmissionControl<C, K> {
        let snapshot = LiveSnapshot::new(ConfigSnapshot::new(
            Vec::new(),
            Vec::new(),
            self.config.catch_all_shared_quota(),
        ));
        let drainer =
            Arc::new(QueueDrainer::with_sink(QuotaTracker::new(), snapshot, &self.config, self.sink));
        let watcher = Arc::new(ConfigWatcher::new(self.source, drainer.clone(), &self.config));
        tracing::debug!(
            max_queue_length = self.config.max_queue_length(),
            wait_timeout = ?self.config.wait_timeout(),
            "admission control built"
        );
        AdmissionControl { config: self.config, drainer, watcher }
    }
}
