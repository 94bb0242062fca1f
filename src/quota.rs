//! Reserved and shared quota accounting.
//!
//! The ledger tracks, per bucket, how much reserved quota is left and, per
//! priority band, how much shared quota is left. Every successful acquisition
//! yields a [`QuotaPermit`]; the unit goes back when the permit is released or
//! dropped, exactly once.
//!
//! Reserved units can be handed straight to a listener waiting on the same
//! bucket instead of going back to the ledger. The listener receives a fresh
//! permit and the ledger count does not move.
//!
//! Shared quota is borrowed downwards only: a bucket draws from its own band
//! first and then from each lower band, never from a band above it.

use crate::bucket::Bucket;
use crate::priority::{PriorityBand, BAND_COUNT};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};

/// Single-use slot a granted permit is delivered through.
pub type GrantSlot = oneshot::Sender<QuotaPermit>;

/// Where a permit's unit was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSource {
    /// The bucket's own reserved quota.
    Reserved,
    /// The shared pool of the given band.
    Shared(PriorityBand),
}

impl fmt::Display for QuotaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaSource::Reserved => f.write_str("reserved"),
            QuotaSource::Shared(band) => write!(f, "shared:{}", band),
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    reserved: HashMap<String, i64>,
    shared: [i64; BAND_COUNT],
    listeners: HashMap<String, VecDeque<GrantSlot>>,
}

#[derive(Debug, Default)]
struct Inner {
    ledger: Mutex<Ledger>,
    released: Arc<Notify>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Quota ledger shared by the drainer and every outstanding permit.
///
/// Cloning is cheap; clones share the same ledger.
#[derive(Debug, Clone, Default)]
pub struct QuotaTracker {
    inner: Arc<Inner>,
}

impl QuotaTracker {
    /// Returns an empty ledger. Buckets gain quota through
    /// [`sync_bucket`](Self::sync_bucket).
    pub fn new() -> Self {
        Self::default()
    }

    /// Signalled whenever quota is returned to the ledger or a bucket sync
    /// may have added capacity.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.inner.released.clone()
    }

    /// Apply the difference between `old` and `new` to the ledger.
    ///
    /// `old` is subtracted and `new` added, so units held by in-flight permits
    /// stay accounted for. Remaining counts can go negative when quota shrinks
    /// below what is in use; they recover as those permits are released.
    pub fn sync_bucket(&self, old: Option<&Bucket>, new: Option<&Bucket>) {
        {
            let mut ledger = self.inner.lock();
            if let Some(old) = old {
                let reserved = ledger.reserved.entry(old.name.clone()).or_insert(0);
                *reserved -= i64::from(old.reserved_quota);
                ledger.shared[old.priority.rank()] -= i64::from(old.shared_quota);
            }
            if let Some(new) = new {
                let reserved = ledger.reserved.entry(new.name.clone()).or_insert(0);
                *reserved += i64::from(new.reserved_quota);
                ledger.shared[new.priority.rank()] += i64::from(new.shared_quota);
            }
            if let (Some(old), None) = (old, new) {
                if ledger.reserved.get(&old.name) == Some(&0) {
                    ledger.reserved.remove(&old.name);
                }
            }
        }
        self.inner.released.notify_one();
    }

    /// Take one unit of the bucket's reserved quota, if any is left.
    pub fn acquire_reserved(&self, bucket: &Bucket) -> Option<QuotaPermit> {
        let mut ledger = self.inner.lock();
        let remaining = ledger.reserved.get_mut(&bucket.name)?;
        if *remaining <= 0 {
            return None;
        }
        *remaining -= 1;
        Some(QuotaPermit::new(self.inner.clone(), &bucket.name, QuotaSource::Reserved))
    }

    /// Wait for the next reserved unit released by `bucket`.
    ///
    /// The slot is filled by a future release of a reserved permit for the
    /// same bucket name, oldest listener first.
    /// Listeners whose receivers were dropped are pruned on every call, so a
    /// name nobody releases does not collect dead slots.
    pub fn listen_reserved(&self, bucket: &str, slot: GrantSlot) {
        let mut ledger = self.inner.lock();
        let slots = ledger.listeners.entry(bucket.to_string()).or_default();
        slots.retain(|slot| !slot.is_closed());
        if !slot.is_closed() {
            slots.push_back(slot);
        }
        if slots.is_empty() {
            ledger.listeners.remove(bucket);
        }
    }

    /// Take one unit of shared quota from the bucket's band or, failing that,
    /// the nearest lower band with capacity left.
    pub fn acquire_shared(&self, bucket: &Bucket) -> Option<QuotaPermit> {
        let mut ledger = self.inner.lock();
        let band = bucket
            .priority
            .borrow_order()
            .iter()
            .copied()
            .find(|band| ledger.shared[band.rank()] > 0)?;
        ledger.shared[band.rank()] -= 1;
        Some(QuotaPermit::new(self.inner.clone(), &bucket.name, QuotaSource::Shared(band)))
    }

    /// Reserved units currently free for `bucket`.
    pub fn remaining_reserved(&self, bucket: &str) -> i64 {
        self.inner.lock().reserved.get(bucket).copied().unwrap_or(0)
    }

    /// Shared units currently free in `band`.
    pub fn remaining_shared(&self, band: PriorityBand) -> i64 {
        self.inner.lock().shared[band.rank()]
    }

    /// Listeners parked on `bucket` whose receivers are still alive. Dead
    /// listeners found along the way are dropped.
    pub fn listener_count(&self, bucket: &str) -> usize {
        let mut ledger = self.inner.lock();
        let Some(slots) = ledger.listeners.get_mut(bucket) else {
            return 0;
        };
        slots.retain(|slot| !slot.is_closed());
        let live = slots.len();
        if live == 0 {
            ledger.listeners.remove(bucket);
        }
        live
    }
}

fn return_reserved(inner: &Arc<Inner>, bucket: &str) {
    loop {
        let slot = {
            let mut ledger = inner.lock();
            let next = ledger.listeners.get_mut(bucket).and_then(|slots| {
                while let Some(slot) = slots.pop_front() {
                    if !slot.is_closed() {
                        return Some(slot);
                    }
                }
                None
            });
            if ledger.listeners.get(bucket).is_some_and(VecDeque::is_empty) {
                ledger.listeners.remove(bucket);
            }
            if next.is_none() {
                *ledger.reserved.entry(bucket.to_string()).or_insert(0) += 1;
            }
            next
        };

        let Some(slot) = slot else {
            inner.released.notify_one();
            return;
        };
        let permit = QuotaPermit::new(inner.clone(), bucket, QuotaSource::Reserved);
        match slot.send(permit) {
            Ok(()) => {
                tracing::debug!(bucket, "reserved quota handed to listener");
                return;
            }
            // Listener went away between the check and the send; try the next one.
            Err(permit) => permit.forget(),
        }
    }
}

/// One unit of granted quota.
///
/// Releasing it (explicitly or by dropping) returns the unit, or hands it to
/// the oldest reserved listener of the same bucket.
pub struct QuotaPermit {
    inner: Arc<Inner>,
    bucket: String,
    source: QuotaSource,
    released: bool,
}

impl QuotaPermit {
    fn new(inner: Arc<Inner>, bucket: &str, source: QuotaSource) -> Self {
        Self { inner, bucket: bucket.to_string(), source, released: false }
    }

    /// Returns the name of the bucket the unit was granted to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the pool the unit was taken from.
    pub fn source(&self) -> QuotaSource {
        self.source
    }

    /// Give the unit back now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn forget(mut self) {
        self.released = true;
    }

    fn release_once(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        match self.source {
            QuotaSource::Reserved => return_reserved(&self.inner, &self.bucket),
            QuotaSource::Shared(band) => {
                self.inner.lock().shared[band.rank()] += 1;
                self.inner.released.notify_one();
            }
        }
    }
}

impl fmt::Debug for QuotaPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaPermit")
            .field("bucket", &self.bucket)
            .field("source", &self.source)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}
