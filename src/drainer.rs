//! Queue drainer: moves waiters from the WRR queues to quota grants.
//!
//! Each pass looks at the bands from `Top` down and handles the first waiter it
//! can dequeue:
//!
//! - its caller already gave up: discard it;
//! - its bucket no longer exists: park it on the reserved listener list for
//!   that name (it is then freed by a matching release or by its timeout);
//! - its bucket has weight 0: try reserved quota only, else requeue;
//! - otherwise try reserved quota, then shared quota, else requeue.
//!
//! Requeued waiters go back to the front of their bucket queue, and the pass
//! moves on to the band's other buckets. When every bucket in the band is out
//! of quota the drainer sleeps until an enqueue or a quota release wakes it, or
//! the idle poll interval elapses.
//!
//! Waiters whose callers gave up stay queued until they are dequeued. Once a
//! band holds as many waiters as the queue ceiling, the next enqueue into it
//! prunes them first.

use crate::bucket::Bucket;
use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::priority::{PriorityBand, BAND_COUNT};
use crate::quota::{GrantSlot, QuotaPermit, QuotaTracker};
use crate::snapshot::{ConfigSnapshot, LiveSnapshot};
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, TelemetrySink};
use crate::wrr::WrrQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// A queued request waiting for its grant.
#[derive(Debug)]
pub struct Waiter {
    slot: GrantSlot,
}

/// What a single drain pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No band had a waiter.
    Idle,
    /// A waiter received a permit.
    Granted,
    /// No quota was available; the waiter was put back.
    Requeued,
    /// The waiter's bucket was missing; it now listens for reserved releases.
    Parked,
    /// The waiter's caller had already gone away.
    Discarded,
}

/// Counts a waiter against the queue ceiling until dropped.
#[derive(Debug)]
struct QueueTicket {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handoff slot returned by [`QueueDrainer::enqueue`].
///
/// The request counts against the queue ceiling until this value is consumed
/// by [`wait`](Admission::wait) or dropped.
#[derive(Debug)]
pub struct Admission {
    bucket: String,
    rx: oneshot::Receiver<QuotaPermit>,
    enqueued_at: Instant,
    _ticket: QueueTicket,
}

impl Admission {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Wait for a grant for at most `timeout`.
    ///
    /// A waiter whose slot is dropped without a grant (the drainer shut down)
    /// is reported as a timeout as well.
    pub async fn wait(self, timeout: Duration) -> Result<QuotaPermit, AdmissionError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => {
                Err(AdmissionError::Timeout { waited: self.enqueued_at.elapsed(), timeout })
            }
        }
    }
}

/// The single consumer of the WRR queues.
pub struct QueueDrainer<K = NullSink> {
    queues: [WrrQueue<Waiter>; BAND_COUNT],
    tracker: QuotaTracker,
    snapshot: LiveSnapshot<ConfigSnapshot>,
    outstanding: Arc<AtomicUsize>,
    max_queue_length: usize,
    idle_poll_interval: Duration,
    wakeup: Arc<Notify>,
    sink: K,
}

impl QueueDrainer<NullSink> {
    pub fn new(
        tracker: QuotaTracker,
        snapshot: LiveSnapshot<ConfigSnapshot>,
        config: &AdmissionConfig,
    ) -> Self {
        Self::with_sink(tracker, snapshot, config, NullSink)
    }
}

impl<K> QueueDrainer<K>
where
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    pub fn with_sink(
        tracker: QuotaTracker,
        snapshot: LiveSnapshot<ConfigSnapshot>,
        config: &AdmissionConfig,
        sink: K,
    ) -> Self {
        let drainer = Self {
            queues: PriorityBand::ALL.map(WrrQueue::new),
            wakeup: tracker.wakeup(),
            tracker,
            snapshot,
            outstanding: Arc::new(AtomicUsize::new(0)),
            max_queue_length: config.max_queue_length(),
            idle_poll_interval: config.idle_poll_interval(),
            sink,
        };
        drainer.reload_weights(&drainer.snapshot.load());
        drainer
    }

    fn queue(&self, band: PriorityBand) -> &WrrQueue<Waiter> {
        &self.queues[band.rank()]
    }

    /// Current configuration snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load()
    }

    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Waiters currently counted against the queue ceiling.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Waiters sitting in `band`'s queue.
    pub fn queued_in(&self, band: PriorityBand) -> usize {
        self.queue(band).len()
    }

    /// Queue a request for `bucket`, or reject it if the ceiling is reached.
    pub fn enqueue(&self, bucket: &Bucket) -> Result<Admission, AdmissionError> {
        let max = self.max_queue_length;
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|outstanding| AdmissionError::QueueFull { outstanding, max })?;
        let ticket = QueueTicket { outstanding: self.outstanding.clone() };

        let queue = self.queue(bucket.priority);
        if queue.len() >= max {
            // Callers that gave up leave their waiter behind until it is dequeued.
            let pruned = queue.retain(|waiter| !waiter.slot.is_closed());
            tracing::debug!(band = %bucket.priority, pruned, "pruned abandoned waiters");
        }
        let (slot, rx) = oneshot::channel();
        queue.enqueue(&bucket.name, Waiter { slot });
        self.wakeup.notify_one();
        Ok(Admission {
            bucket: bucket.name.clone(),
            rx,
            enqueued_at: Instant::now(),
            _ticket: ticket,
        })
    }

    /// Rebuild every band's weight map from `snapshot`.
    pub fn reload_weights(&self, snapshot: &ConfigSnapshot) {
        for queue in &self.queues {
            queue.reload(snapshot.buckets());
        }
        self.wakeup.notify_one();
    }

    /// Swap in a new snapshot and rebuild the weights it implies.
    pub(crate) fn publish(&self, snapshot: ConfigSnapshot) {
        for queue in &self.queues {
            queue.reload(snapshot.buckets());
        }
        self.snapshot.store(snapshot);
        self.wakeup.notify_one();
    }

    /// Work through the highest non-empty band until one waiter is granted,
    /// parked or discarded. A bucket that had to be requeued is not drawn
    /// again in the same pass, so `Requeued` means every bucket waiting in
    /// that band is out of quota.
    pub async fn drain_once(&self) -> DrainOutcome {
        for queue in &self.queues {
            let mut stalled: Vec<String> = Vec::new();
            while let Some((name, waiter)) = queue.dequeue_except(&stalled) {
                match self.dispatch(name.clone(), waiter).await {
                    DrainOutcome::Requeued => stalled.push(name),
                    outcome => return outcome,
                }
            }
            if !stalled.is_empty() {
                return DrainOutcome::Requeued;
            }
        }
        DrainOutcome::Idle
    }

    async fn dispatch(&self, name: String, waiter: Waiter) -> DrainOutcome {
        if waiter.slot.is_closed() {
            tracing::debug!(bucket = %name, "discarding waiter whose caller gave up");
            return DrainOutcome::Discarded;
        }

        let snapshot = self.snapshot.load();
        let Some(bucket) = snapshot.bucket(&name) else {
            tracing::warn!(
                bucket = %name,
                "bucket of queued request no longer exists; parking on reserved listener"
            );
            self.tracker.listen_reserved(&name, waiter.slot);
            self.emit(AdmissionEvent::Parked { bucket: name }).await;
            return DrainOutcome::Parked;
        };

        let permit = if bucket.weight == 0 {
            self.tracker.acquire_reserved(bucket)
        } else {
            self.tracker.acquire_reserved(bucket).or_else(|| self.tracker.acquire_shared(bucket))
        };

        match permit {
            Some(permit) => {
                let source = permit.source();
                match waiter.slot.send(permit) {
                    Ok(()) => {
                        tracing::debug!(bucket = %name, %source, "granted quota");
                        self.emit(AdmissionEvent::Granted { bucket: name, source }).await;
                        DrainOutcome::Granted
                    }
                    // The caller left after the check above; the returned permit drops here.
                    Err(_) => DrainOutcome::Discarded,
                }
            }
            None => {
                self.queue(bucket.priority).requeue(&name, waiter);
                tracing::trace!(bucket = %name, "no quota available; requeued");
                self.emit(AdmissionEvent::Requeued { bucket: name }).await;
                DrainOutcome::Requeued
            }
        }
    }

    /// Drain forever. Run this on exactly one task per drainer.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            max_queue_length = self.max_queue_length,
            idle_poll_interval = ?self.idle_poll_interval,
            "queue drainer started"
        );
        loop {
            match self.drain_once().await {
                DrainOutcome::Idle | DrainOutcome::Requeued => {
                    let _ = tokio::time::timeout(self.idle_poll_interval, self.wakeup.notified())
                        .await;
                }
                DrainOutcome::Granted | DrainOutcome::Parked | DrainOutcome::Discarded => {}
            }
        }
    }

    pub(crate) async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}
