//! Configuration sources.
//!
//! Where buckets and bindings come from is not this crate's concern. A
//! [`ConfigSource`] only has to list both kinds of object and broadcast change
//! notifications. [`InMemoryConfigSource`] is a complete in-process source,
//! useful for embedding and for tests.

use crate::bucket::{Bucket, BucketBinding};
use crate::error::ConfigError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Capacity of the in-memory source's change channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A change to one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object as it is after the change (or as it was, for deletions).
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Deleted(obj) => obj,
            WatchEvent::Updated { new, .. } => new,
        }
    }
}

/// A change notification for either object kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    Bucket(WatchEvent<Bucket>),
    Binding(WatchEvent<BucketBinding>),
}

/// Listable, watchable collection of buckets and bindings.
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// All buckets currently defined.
    async fn list_buckets(&self) -> Result<Vec<Bucket>, ConfigError>;

    /// All bindings currently defined.
    async fn list_bindings(&self) -> Result<Vec<BucketBinding>, ConfigError>;

    /// Subscribe to change notifications. Events published before the call are not replayed.
    fn watch(&self) -> broadcast::Receiver<ConfigEvent>;
}

#[derive(Debug, Default)]
struct Objects {
    buckets: BTreeMap<String, Bucket>,
    bindings: BTreeMap<String, BucketBinding>,
}

/// In-process configuration source backed by a broadcast channel.
#[derive(Debug, Clone)]
pub struct InMemoryConfigSource {
    objects: Arc<Mutex<Objects>>,
    sender: broadcast::Sender<ConfigEvent>,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryConfigSource {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            objects: Arc::new(Mutex::new(Objects::default())),
            sender,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: ConfigEvent) {
        // No subscribers is fine; the next list picks the change up.
        let _ = self.sender.send(event);
    }

    /// Create or replace a bucket.
    pub fn apply_bucket(&self, bucket: Bucket) {
        let old = self.lock().buckets.insert(bucket.name.clone(), bucket.clone());
        self.publish(ConfigEvent::Bucket(match old {
            Some(old) => WatchEvent::Updated { old, new: bucket },
            None => WatchEvent::Added(bucket),
        }));
    }

    /// Remove a bucket; returns it if it existed.
    pub fn delete_bucket(&self, name: &str) -> Option<Bucket> {
        let removed = self.lock().buckets.remove(name)?;
        self.publish(ConfigEvent::Bucket(WatchEvent::Deleted(removed.clone())));
        Some(removed)
    }

    /// Create or replace a binding.
    pub fn apply_binding(&self, binding: BucketBinding) {
        let old = self.lock().bindings.insert(binding.name.clone(), binding.clone());
        self.publish(ConfigEvent::Binding(match old {
            Some(old) => WatchEvent::Updated { old, new: binding },
            None => WatchEvent::Added(binding),
        }));
    }

    /// Remove a binding; returns it if it existed.
    pub fn delete_binding(&self, name: &str) -> Option<BucketBinding> {
        let removed = self.lock().bindings.remove(name)?;
        self.publish(ConfigEvent::Binding(WatchEvent::Deleted(removed.clone())));
        Some(removed)
    }

    /// Make list calls fail until switched back, as a flaky backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), ConfigError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(ConfigError::Source("in-memory source marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, ConfigError> {
        self.check_available()?;
        Ok(self.lock().buckets.values().cloned().collect())
    }

    async fn list_bindings(&self) -> Result<Vec<BucketBinding>, ConfigError> {
        self.check_available()?;
        Ok(self.lock().bindings.values().cloned().collect())
    }

    fn watch(&self) -> broadcast::Receiver<ConfigEvent> {
        self.sender.subscribe()
    }
}
