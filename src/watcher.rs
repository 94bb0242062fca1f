//! Keeps the live snapshot and the quota ledger in step with a [`ConfigSource`].
//!
//! The watcher owns the record of which buckets it has applied to the
//! [`QuotaTracker`](crate::quota::QuotaTracker). Every change, whether a single
//! watch event or a full relist, is turned into signed deltas against that
//! record, then published as a fresh [`ConfigSnapshot`].

use crate::bucket::{Bucket, BucketBinding, CATCH_ALL_BUCKET};
use crate::config::AdmissionConfig;
use crate::drainer::QueueDrainer;
use crate::error::ConfigError;
use crate::snapshot::ConfigSnapshot;
use crate::source::{ConfigEvent, ConfigSource, WatchEvent};
use crate::telemetry::{AdmissionEvent, NullSink, TelemetrySink};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::OnceCell;

#[derive(Debug, Default)]
struct Applied {
    buckets: BTreeMap<String, Bucket>,
    bindings: BTreeMap<String, BucketBinding>,
}

/// Applies configuration changes from a source to a drainer.
pub struct ConfigWatcher<C, K = NullSink> {
    source: Arc<C>,
    drainer: Arc<QueueDrainer<K>>,
    catch_all_shared: u32,
    applied: Mutex<Applied>,
    initial_sync: OnceCell<()>,
    events: Mutex<Option<broadcast::Receiver<ConfigEvent>>>,
}

impl<C, K> ConfigWatcher<C, K>
where
    C: ConfigSource,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    /// Create a watcher and immediately publish a snapshot holding only the
    /// built-in catch-all bucket, so unmatched requests have quota before the
    /// first sync completes.
    ///
    /// The watch subscription is taken here; changes made before [`run`](Self::run)
    /// starts are buffered rather than lost.
    pub fn new(source: Arc<C>, drainer: Arc<QueueDrainer<K>>, config: &AdmissionConfig) -> Self {
        let events = source.watch();
        let watcher = Self {
            events: Mutex::new(Some(events)),
            source,
            drainer,
            catch_all_shared: config.catch_all_shared_quota(),
            applied: Mutex::new(Applied::default()),
            initial_sync: OnceCell::new(),
        };
        watcher.update(|_| {});
        watcher
    }

    fn lock(&self) -> MutexGuard<'_, Applied> {
        self.applied.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True once a full listing has been applied.
    pub fn is_synced(&self) -> bool {
        self.initial_sync.initialized()
    }

    /// Perform the initial full sync if it has not succeeded yet.
    ///
    /// Concurrent callers share one attempt; a failed attempt is retried by the
    /// next call.
    pub async fn ensure_synced(&self) -> Result<(), ConfigError> {
        self.initial_sync.get_or_try_init(|| self.resync()).await.map(|_| ())
    }

    /// List everything from the source and replace the applied state with it.
    ///
    /// On failure the previous snapshot stays in effect.
    pub async fn resync(&self) -> Result<(), ConfigError> {
        let listed = async {
            let buckets = self.source.list_buckets().await?;
            let bindings = self.source.list_bindings().await?;
            Ok::<_, ConfigError>((buckets, bindings))
        }
        .await;

        let (buckets, bindings) = match listed {
            Ok(listed) => listed,
            Err(err) => {
                tracing::warn!(error = %err, "listing configuration failed; keeping previous snapshot");
                self.drainer
                    .emit(AdmissionEvent::ConfigSourceFailed { error: err.to_string() })
                    .await;
                return Err(err);
            }
        };

        let synced = self.update(|applied| {
            applied.buckets = buckets.into_iter().map(|b| (b.name.clone(), b)).collect();
            applied.bindings = bindings.into_iter().map(|b| (b.name.clone(), b)).collect();
        });
        tracing::info!(event = %synced, "configuration resynced");
        self.drainer.emit(synced).await;
        Ok(())
    }

    /// Apply one watch event.
    pub async fn apply(&self, event: ConfigEvent) {
        let synced = self.update(|applied| match event {
            ConfigEvent::Bucket(WatchEvent::Added(bucket))
            | ConfigEvent::Bucket(WatchEvent::Updated { new: bucket, .. }) => {
                applied.buckets.insert(bucket.name.clone(), bucket);
            }
            ConfigEvent::Bucket(WatchEvent::Deleted(bucket)) => {
                if bucket.is_catch_all() {
                    tracing::info!("catch-all bucket deleted; restoring built-in default");
                }
                applied.buckets.remove(&bucket.name);
            }
            ConfigEvent::Binding(WatchEvent::Added(binding))
            | ConfigEvent::Binding(WatchEvent::Updated { new: binding, .. }) => {
                applied.bindings.insert(binding.name.clone(), binding);
            }
            ConfigEvent::Binding(WatchEvent::Deleted(binding)) => {
                applied.bindings.remove(&binding.name);
            }
        });
        tracing::debug!(event = %synced, "configuration change applied");
        self.drainer.emit(synced).await;
    }

    /// Mutate the applied state, settle the ledger and publish a new snapshot.
    fn update(&self, change: impl FnOnce(&mut Applied)) -> AdmissionEvent {
        let mut applied = self.lock();
        let previous = applied.buckets.clone();
        change(&mut applied);
        applied
            .buckets
            .entry(CATCH_ALL_BUCKET.to_string())
            .or_insert_with(|| Bucket::catch_all(self.catch_all_shared));

        let tracker = self.drainer.tracker();
        for (name, old) in &previous {
            if !applied.buckets.contains_key(name) {
                tracker.sync_bucket(Some(old), None);
            }
        }
        for (name, new) in &applied.buckets {
            match previous.get(name) {
                Some(old) if old == new => {}
                old => tracker.sync_bucket(old, Some(new)),
            }
        }

        self.drainer.publish(ConfigSnapshot::new(
            applied.buckets.values().cloned().collect(),
            applied.bindings.values().cloned().collect(),
            self.catch_all_shared,
        ));
        AdmissionEvent::ConfigSynced {
            buckets: applied.buckets.len(),
            bindings: applied.bindings.len(),
        }
    }

    /// Handle one receive result; returns `false` once the source has closed.
    async fn handle(&self, received: Result<ConfigEvent, RecvError>) -> bool {
        match received {
            Ok(event) => {
                // A successful relist already includes this event.
                if !self.is_synced() && self.ensure_synced().await.is_ok() {
                    return true;
                }
                self.apply(event).await;
                true
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "configuration watch lagged; resyncing");
                let _ = self.resync().await;
                true
            }
            Err(RecvError::Closed) => {
                tracing::info!("configuration source closed; watcher stopping");
                false
            }
        }
    }

    /// Sync, then apply changes until the source closes.
    pub async fn run(self: Arc<Self>) {
        let taken = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        let mut events = taken.unwrap_or_else(|| self.source.watch());
        if self.ensure_synced().await.is_err() {
            tracing::warn!("initial configuration sync failed; retrying on the next change");
        }
        while self.handle(events.recv().await).await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::PriorityBand;
    use crate::quota::QuotaTracker;
    use crate::snapshot::LiveSnapshot;
    use crate::source::InMemoryConfigSource;
    use crate::telemetry::MemorySink;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn setup(
        source: &InMemoryConfigSource,
    ) -> (Arc<QueueDrainer<MemorySink>>, ConfigWatcher<InMemoryConfigSource, MemorySink>) {
        let config = AdmissionConfig::default().with_catch_all_shared_quota(4);
        let drainer = Arc::new(QueueDrainer::with_sink(
            QuotaTracker::new(),
            LiveSnapshot::new(ConfigSnapshot::default()),
            &config,
            MemorySink::new(),
        ));
        let watcher = ConfigWatcher::new(Arc::new(source.clone()), drainer.clone(), &config);
        (drainer, watcher)
    }

    #[tokio::test]
    async fn catch_all_has_quota_before_first_sync() {
        let (drainer, watcher) = setup(&InMemoryConfigSource::new());
        assert!(!watcher.is_synced());
        assert_eq!(drainer.snapshot().catch_all().shared_quota, 4);
        assert_eq!(drainer.tracker().remaining_shared(PriorityBand::Lowest), 4);
    }

    #[tokio::test]
    async fn initial_sync_applies_listed_objects() {
        let source = InMemoryConfigSource::new();
        source.apply_bucket(Bucket::new("b", PriorityBand::High).with_reserved_quota(2));
        source.apply_binding(BucketBinding::new("bind", "b"));
        let (drainer, watcher) = setup(&source);

        watcher.ensure_synced().await.unwrap();
        assert!(watcher.is_synced());
        assert_eq!(drainer.tracker().remaining_reserved("b"), 2);
        assert_eq!(drainer.snapshot().bindings().len(), 1);
        assert!(drainer
            .sink()
            .events()
            .contains(&AdmissionEvent::ConfigSynced { buckets: 2, bindings: 1 }));
    }

    #[tokio::test]
    async fn updates_apply_signed_delta_while_permits_are_held() {
        let source = InMemoryConfigSource::new();
        let (drainer, watcher) = setup(&source);
        let v1 = Bucket::new("b", PriorityBand::High).with_reserved_quota(3);
        watcher.apply(ConfigEvent::Bucket(WatchEvent::Added(v1.clone()))).await;

        let held = drainer.tracker().acquire_reserved(&v1).unwrap();
        let v2 = v1.clone().with_reserved_quota(1);
        watcher
            .apply(ConfigEvent::Bucket(WatchEvent::Updated { old: v1, new: v2 }))
            .await;
        assert_eq!(drainer.tracker().remaining_reserved("b"), 0);
        held.release();
        assert_eq!(drainer.tracker().remaining_reserved("b"), 1);
    }

    #[tokio::test]
    async fn deleted_catch_all_is_restored() {
        let source = InMemoryConfigSource::new();
        let (drainer, watcher) = setup(&source);
        let custom = Bucket::catch_all(9);
        watcher.apply(ConfigEvent::Bucket(WatchEvent::Added(custom.clone()))).await;
        assert_eq!(drainer.tracker().remaining_shared(PriorityBand::Lowest), 9);

        watcher.apply(ConfigEvent::Bucket(WatchEvent::Deleted(custom))).await;
        assert_eq!(drainer.snapshot().catch_all().shared_quota, 4);
        assert_eq!(drainer.tracker().remaining_shared(PriorityBand::Lowest), 4);
    }

    #[tokio::test]
    async fn deleting_bucket_removes_its_quota() {
        let source = InMemoryConfigSource::new();
        let (drainer, watcher) = setup(&source);
        let bucket = Bucket::new("gone", PriorityBand::Normal).with_shared_quota(5);
        watcher.apply(ConfigEvent::Bucket(WatchEvent::Added(bucket.clone()))).await;
        assert_eq!(drainer.tracker().remaining_shared(PriorityBand::Normal), 5);

        watcher.apply(ConfigEvent::Bucket(WatchEvent::Deleted(bucket))).await;
        assert!(drainer.snapshot().bucket("gone").is_none());
        assert_eq!(drainer.tracker().remaining_shared(PriorityBand::Normal), 0);
    }

    #[tokio::test]
    async fn failed_listing_keeps_previous_snapshot() {
        let source = InMemoryConfigSource::new();
        source.apply_bucket(Bucket::new("keep", PriorityBand::Low).with_reserved_quota(1));
        let (drainer, watcher) = setup(&source);
        watcher.ensure_synced().await.unwrap();

        source.set_unavailable(true);
        source.apply_bucket(Bucket::new("new", PriorityBand::Low));
        assert!(watcher.resync().await.is_err());
        assert!(drainer.snapshot().bucket("keep").is_some());
        assert!(drainer.snapshot().bucket("new").is_none());
        assert!(drainer
            .sink()
            .events()
            .iter()
            .any(|event| matches!(event, AdmissionEvent::ConfigSourceFailed { .. })));
    }

    #[tokio::test]
    async fn lag_triggers_full_resync() {
        let source = InMemoryConfigSource::new();
        let (drainer, watcher) = setup(&source);
        watcher.ensure_synced().await.unwrap();

        source.apply_bucket(Bucket::new("missed", PriorityBand::Top).with_reserved_quota(2));
        assert!(watcher.handle(Err(RecvError::Lagged(1))).await);
        assert_eq!(drainer.tracker().remaining_reserved("missed"), 2);
        assert!(!watcher.handle(Err(RecvError::Closed)).await);
    }

    #[tokio::test]
    async fn failed_initial_sync_is_retried_on_next_event() {
        let source = InMemoryConfigSource::new();
        source.set_unavailable(true);
        let (drainer, watcher) = setup(&source);
        assert!(watcher.ensure_synced().await.is_err());

        source.set_unavailable(false);
        let bucket = Bucket::new("late", PriorityBand::Medium).with_reserved_quota(1);
        source.apply_bucket(bucket.clone());
        assert!(watcher.handle(Ok(ConfigEvent::Bucket(WatchEvent::Added(bucket)))).await);
        assert!(watcher.is_synced());
        assert_eq!(drainer.tracker().remaining_reserved("late"), 1);
    }

    #[tokio::test]
    async fn run_applies_live_changes() {
        let source = InMemoryConfigSource::new();
        let (drainer, watcher) = setup(&source);
        let task = tokio::spawn(Arc::new(watcher).run());

        // Wait for the watcher to subscribe and sync.
        let synced = || {
            drainer
                .sink()
                .events()
                .iter()
                .any(|event| matches!(event, AdmissionEvent::ConfigSynced { .. }))
        };
        while !synced() {
            tokio::task::yield_now().await;
        }
        source.apply_bucket(Bucket::new("live", PriorityBand::High).with_reserved_quota(1));
        while drainer.snapshot().bucket("live").is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(drainer.tracker().remaining_reserved("live"), 1);
        task.abort();
    }

    #[tokio::test]
    async fn failed_listing_and_catch_all_restore_are_logged() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let source = InMemoryConfigSource::new();
        let (_drainer, watcher) = setup(&source);
        source.set_unavailable(true);
        assert!(watcher.resync().await.is_err());
        watcher
            .apply(ConfigEvent::Bucket(WatchEvent::Deleted(Bucket::catch_all(4))))
            .await;

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("listing configuration failed"), "missing warning: {logs}");
        assert!(logs.contains("restoring built-in default"), "missing info: {logs}");
    }
}
