//! Binding selection.
//!
//! Rules inside a binding are ANDed, values inside a rule are ORed. Bindings are
//! tried in a fixed order: bucket priority first, then the number of rules
//! (more specific first), then name. A binding whose bucket is unknown sorts
//! last and never matches.

use crate::bucket::{Bucket, BucketBinding, Rule};
use crate::subject::Subject;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// True if any of the subject's values for the rule's field is listed.
pub fn rule_matches(subject: &Subject, rule: &Rule) -> bool {
    subject
        .values(rule.field)
        .into_iter()
        .any(|have| rule.values.iter().any(|want| want == have))
}

/// True if every rule matches. A binding with no rules matches nothing.
pub fn binding_matches(subject: &Subject, binding: &BucketBinding) -> bool {
    !binding.rules.is_empty() && binding.rules.iter().all(|rule| rule_matches(subject, rule))
}

/// Sort bindings into first-match order against the given bucket set.
pub fn order_bindings(
    mut bindings: Vec<BucketBinding>,
    buckets: &BTreeMap<String, Bucket>,
) -> Vec<BucketBinding> {
    bindings.sort_by(|a, b| compare(a, b, buckets));
    bindings
}

fn compare(a: &BucketBinding, b: &BucketBinding, buckets: &BTreeMap<String, Bucket>) -> Ordering {
    let rank = |binding: &BucketBinding| {
        buckets.get(&binding.bucket).map(|bucket| bucket.priority.rank()).unwrap_or(usize::MAX)
    };
    rank(a)
        .cmp(&rank(b))
        .then_with(|| b.rules.len().cmp(&a.rules.len()))
        .then_with(|| a.name.cmp(&b.name))
}

/// Return the bucket of the first matching binding, or `None` if nothing
/// matches. `bindings` must already be in [`order_bindings`] order.
pub fn select_bucket<'a>(
    subject: &Subject,
    bindings: &[BucketBinding],
    buckets: &'a BTreeMap<String, Bucket>,
) -> Option<&'a Bucket> {
    bindings
        .iter()
        .filter(|binding| binding_matches(subject, binding))
        .find_map(|binding| buckets.get(&binding.bucket))
}
