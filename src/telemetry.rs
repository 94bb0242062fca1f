//! Observable admission events.
//!
//! The drainer, the filter and the config watcher describe what they do as
//! [`AdmissionEvent`]s. Events flow into a [`TelemetrySink`], which is just a
//! `tower::Service<AdmissionEvent>`, so sinks compose with ordinary tower
//! combinators.
//!
//! ```rust
//! use bucketgate::telemetry::{AdmissionEvent, MemorySink};
//! use std::time::Duration;
//!
//! let sink = MemorySink::new();
//! let event = AdmissionEvent::TimedOut { bucket: "extra".into(), waited: Duration::from_secs(60) };
//! assert!(event.to_string().contains("timed out"));
//! assert!(sink.is_empty());
//! ```

use crate::priority::PriorityBand;
use crate::quota::QuotaSource;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Events emitted while admitting requests and reloading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A request joined its bucket's queue.
    Enqueued { bucket: String, band: PriorityBand, queued: usize },
    /// The queue was full; the request was rejected without waiting.
    Rejected { bucket: String, queued: usize },
    /// The drainer granted quota to a waiter.
    Granted { bucket: String, source: QuotaSource },
    /// No quota was available; the waiter went back to the front of its queue.
    Requeued { bucket: String },
    /// The waiter's bucket disappeared; it now waits for a reserved release on that name.
    Parked { bucket: String },
    /// A request waited the full timeout without being granted quota.
    TimedOut { bucket: String, waited: Duration },
    /// An admitted request finished and released its quota.
    Completed { bucket: String, waited: Duration, duration: Duration },
    /// A configuration snapshot was applied.
    ConfigSynced { buckets: usize, bindings: usize },
    /// The configuration source failed; the previous snapshot is still in use.
    ConfigSourceFailed { error: String },
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enqueued { bucket, band, queued } => {
                write!(f, "enqueued bucket={} band={} queued={}", bucket, band, queued)
            }
            Self::Rejected { bucket, queued } => {
                write!(f, "rejected bucket={} queued={} (queue full)", bucket, queued)
            }
            Self::Granted { bucket, source } => {
                write!(f, "granted bucket={} source={}", bucket, source)
            }
            Self::Requeued { bucket } => write!(f, "requeued bucket={}", bucket),
            Self::Parked { bucket } => write!(f, "parked bucket={} (bucket not found)", bucket),
            Self::TimedOut { bucket, waited } => {
                write!(f, "timed out bucket={} waited={:?}", bucket, waited)
            }
            Self::Completed { bucket, waited, duration } => {
                write!(f, "completed bucket={} waited={:?} duration={:?}", bucket, waited, duration)
            }
            Self::ConfigSynced { buckets, bindings } => {
                write!(f, "config synced buckets={} bindings={}", buckets, bindings)
            }
            Self::ConfigSourceFailed { error } => write!(f, "config source failed: {}", error),
        }
    }
}

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Admission never waits on or fails because of telemetry.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match &event {
            AdmissionEvent::ConfigSourceFailed { .. } | AdmissionEvent::Parked { .. } => {
                tracing::warn!(event = %event, "admission_event")
            }
            _ => tracing::info!(event = %event, "admission_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory, evicting the oldest past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Returns a sink holding up to 10 000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Returns a sink holding up to `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a copy of the stored events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.lock().clone()
    }

    /// Drop every stored event. The eviction count is kept.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of stored events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns how many events were dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
