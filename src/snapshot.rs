//! Live configuration snapshots.
//!
//! Readers on the request path load the current [`ConfigSnapshot`] without
//! locking; the watcher swaps in a new one after every change.

use crate::bucket::{Bucket, BucketBinding, CATCH_ALL_BUCKET, DEFAULT_CATCH_ALL_SHARED_QUOTA};
use crate::matcher;
use crate::subject::Subject;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `LiveSnapshot<T>` gives cheap reads and wholesale replacement of shared state.
#[derive(Debug)]
pub struct LiveSnapshot<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for LiveSnapshot<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> LiveSnapshot<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Current value (cheap clone of Arc).
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn store(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}

/// Buckets by name plus bindings in first-match order.
///
/// Always contains a catch-all bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    buckets: BTreeMap<String, Bucket>,
    bindings: Vec<BucketBinding>,
    catch_all: Bucket,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new(), DEFAULT_CATCH_ALL_SHARED_QUOTA)
    }
}

impl ConfigSnapshot {
    /// Build a snapshot, inserting the catch-all bucket if `buckets` lacks one
    /// and ordering the bindings.
    pub fn new(buckets: Vec<Bucket>, bindings: Vec<BucketBinding>, catch_all_shared: u32) -> Self {
        let mut buckets: BTreeMap<String, Bucket> =
            buckets.into_iter().map(|bucket| (bucket.name.clone(), bucket)).collect();
        let catch_all = buckets
            .entry(CATCH_ALL_BUCKET.to_string())
            .or_insert_with(|| Bucket::catch_all(catch_all_shared))
            .clone();
        let bindings = matcher::order_bindings(bindings, &buckets);
        Self { buckets, bindings, catch_all }
    }

    pub fn bucket(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    /// Bindings in first-match order.
    pub fn bindings(&self) -> &[BucketBinding] {
        &self.bindings
    }

    pub fn catch_all(&self) -> &Bucket {
        &self.catch_all
    }

    /// Bucket for the first binding matching `subject`, or the catch-all.
    pub fn select(&self, subject: &Subject) -> &Bucket {
        matcher::select_bucket(subject, &self.bindings, &self.buckets)
            .unwrap_or_else(|| self.catch_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{Rule, RuleField};
    use crate::priority::PriorityBand;
    use crate::subject::UserInfo;

    #[test]
    fn live_snapshot_swaps_wholesale() {
        let live = LiveSnapshot::new(1);
        let before = live.load();
        live.store(2);
        assert_eq!(*before, 1);
        assert_eq!(*live.load(), 2);
        let clone = live.clone();
        clone.store(3);
        assert_eq!(*live.load(), 3);
    }

    #[test]
    fn catch_all_is_always_present() {
        let snapshot = ConfigSnapshot::new(vec![], vec![], 7);
        assert_eq!(snapshot.catch_all().shared_quota, 7);
        assert_eq!(snapshot.buckets().count(), 1);
    }

    #[test]
    fn configured_catch_all_is_kept() {
        let custom = Bucket::catch_all(99).with_weight(4);
        let snapshot = ConfigSnapshot::new(vec![custom.clone()], vec![], 7);
        assert_eq!(snapshot.catch_all(), &custom);
    }

    #[test]
    fn unmatched_subject_falls_back_to_catch_all() {
        let snapshot = ConfigSnapshot::new(
            vec![Bucket::new("admins", PriorityBand::Top)],
            vec![BucketBinding::new("admins", "admins")
                .with_rule(Rule::new(RuleField::UserGroups, ["system:masters"]))],
            10,
        );
        let admin = Subject { user: UserInfo::new("root", ["system:masters"]), ..Default::default() };
        assert_eq!(snapshot.select(&admin).name, "admins");
        let guest = Subject { user: UserInfo::new("guest", ["viewers"]), ..Default::default() };
        assert_eq!(snapshot.select(&guest).name, CATCH_ALL_BUCKET);
    }
}
