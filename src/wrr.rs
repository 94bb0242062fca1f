//! Weighted random selection across per-bucket FIFO queues.
//!
//! One `WrrQueue` exists per priority band. Each dequeue draws a bucket with
//! probability proportional to its weight among buckets that currently have
//! waiters, then pops that bucket's oldest waiter. Selection is a linear scan;
//! the number of buckets in a band is bounded by configuration.

use crate::bucket::Bucket;
use crate::priority::PriorityBand;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct State<T> {
    weights: HashMap<String, f64>,
    pending: BTreeMap<String, VecDeque<T>>,
    len: usize,
}

/// Waiters for one priority band, keyed by bucket name.
#[derive(Debug)]
pub struct WrrQueue<T> {
    band: PriorityBand,
    state: Mutex<State<T>>,
}

impl<T> WrrQueue<T> {
    /// Create an empty queue for `band`. Weights are empty until the first
    /// [`reload`](Self::reload).
    pub fn new(band: PriorityBand) -> Self {
        Self {
            band,
            state: Mutex::new(State { weights: HashMap::new(), pending: BTreeMap::new(), len: 0 }),
        }
    }

    /// The band this queue serves.
    pub fn band(&self) -> PriorityBand {
        self.band
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a waiter to the back of its bucket's queue.
    pub fn enqueue(&self, bucket: &str, waiter: T) {
        let mut state = self.lock();
        state.pending.entry(bucket.to_string()).or_default().push_back(waiter);
        state.len += 1;
    }

    /// Put a waiter back at the front of its bucket's queue so it keeps its
    /// place ahead of later arrivals.
    pub fn requeue(&self, bucket: &str, waiter: T) {
        let mut state = self.lock();
        state.pending.entry(bucket.to_string()).or_default().push_front(waiter);
        state.len += 1;
    }

    /// Pop the oldest waiter of a weighted-randomly drawn bucket.
    pub fn dequeue(&self) -> Option<(String, T)> {
        self.dequeue_with_rng(&mut rand::rng())
    }

    /// Like [`dequeue`](Self::dequeue) with a caller-supplied RNG.
    pub fn dequeue_with_rng<R: Rng>(&self, rng: &mut R) -> Option<(String, T)> {
        self.dequeue_except_with_rng(&[], rng)
    }

    /// Like [`dequeue`](Self::dequeue), but buckets named in `skip` are not
    /// drawn even when they have waiters.
    pub fn dequeue_except(&self, skip: &[String]) -> Option<(String, T)> {
        self.dequeue_except_with_rng(skip, &mut rand::rng())
    }

    /// Like [`dequeue_except`](Self::dequeue_except) with a caller-supplied RNG.
    pub fn dequeue_except_with_rng<R: Rng>(
        &self,
        skip: &[String],
        rng: &mut R,
    ) -> Option<(String, T)> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.len == 0 {
            return None;
        }

        let weights = &state.weights;
        let weight_of =
            |name: &str| weights.get(name).copied().filter(|w| *w > 0.0).unwrap_or(0.0);
        let ready = || {
            state
                .pending
                .iter()
                .filter(|(name, queue)| !queue.is_empty() && !skip.contains(*name))
                .map(|(name, _)| name)
        };
        let total: f64 = ready().map(|name| weight_of(name)).sum();

        let chosen = if total > 0.0 {
            let draw = rng.random_range(0.0..total);
            let mut cumulative = 0.0;
            ready()
                .filter(|name| weight_of(name) > 0.0)
                .find(|name| {
                    cumulative += weight_of(name);
                    cumulative > draw
                })
                .or_else(|| ready().filter(|name| weight_of(name) > 0.0).last())
                .cloned()
        } else {
            // Every ready bucket has zero weight; drain one anyway so nobody is stranded.
            ready().next().cloned()
        }?;

        let queue = state.pending.get_mut(&chosen)?;
        let waiter = queue.pop_front()?;
        if queue.is_empty() {
            state.pending.remove(&chosen);
        }
        state.len -= 1;
        Some((chosen, waiter))
    }

    /// Drop every waiter for which `keep` returns false, preserving the order
    /// of the rest. Returns the number removed.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let before = state.len;
        state.pending.retain(|_, queue| {
            queue.retain(|waiter| keep(waiter));
            !queue.is_empty()
        });
        state.len = state.pending.values().map(VecDeque::len).sum();
        before - state.len
    }

    /// Rebuild the weight map from the bucket set, keeping only this band's
    /// buckets. Pending waiters are untouched.
    pub fn reload<'a, I>(&self, buckets: I)
    where
        I: IntoIterator<Item = &'a Bucket>,
    {
        let weights: HashMap<String, f64> = buckets
            .into_iter()
            .filter(|bucket| bucket.priority == self.band)
            .map(|bucket| (bucket.name.clone(), f64::from(bucket.weight)))
            .collect();
        self.lock().weights = weights;
    }

    /// Weight currently configured for `bucket`, if it belongs to this band.
    pub fn weight(&self, bucket: &str) -> Option<f64> {
        self.lock().weights.get(bucket).copied()
    }

    /// Number of waiters queued in this band.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
