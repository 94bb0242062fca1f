//! Buckets, bindings and rules.
//!
//! A [`Bucket`] is a quota pool with a priority band and a weight inside that
//! band. A [`BucketBinding`] routes requests whose [`Subject`](crate::Subject)
//! satisfies all of its rules to one bucket.

use crate::error::ConfigError;
use crate::priority::PriorityBand;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the built-in bucket that receives unmatched traffic.
pub const CATCH_ALL_BUCKET: &str = "extra";

/// Shared quota the catch-all bucket contributes to the `Lowest` band by default.
pub const DEFAULT_CATCH_ALL_SHARED_QUOTA: u32 = 10;

/// A named quota pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "BucketRecord")]
pub struct Bucket {
    pub name: String,
    /// Capacity reserved exclusively for this bucket.
    #[serde(default)]
    pub reserved_quota: u32,
    /// Capacity this bucket adds to its band's shared pool.
    #[serde(default)]
    pub shared_quota: u32,
    pub priority: PriorityBand,
    /// Relative share within the band's WRR queue.
    #[serde(default)]
    pub weight: u32,
}

/// Wire form of a [`Bucket`] before the priority is checked against its name.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketRecord {
    name: String,
    #[serde(default)]
    reserved_quota: u32,
    #[serde(default)]
    shared_quota: u32,
    priority: PriorityBand,
    #[serde(default)]
    weight: u32,
}

/// Only the catch-all bucket may sit in `Lowest`.
impl TryFrom<BucketRecord> for Bucket {
    type Error = ConfigError;

    fn try_from(record: BucketRecord) -> Result<Self, Self::Error> {
        if record.priority == PriorityBand::Lowest && record.name != CATCH_ALL_BUCKET {
            return Err(ConfigError::UnknownPriority(record.priority.to_string()));
        }
        Ok(Self {
            name: record.name,
            reserved_quota: record.reserved_quota,
            shared_quota: record.shared_quota,
            priority: record.priority,
            weight: record.weight,
        })
    }
}

impl Bucket {
    pub fn new(name: impl Into<String>, priority: PriorityBand) -> Self {
        Self { name: name.into(), reserved_quota: 0, shared_quota: 0, priority, weight: 1 }
    }

    /// Set the capacity held exclusively for this bucket.
    pub fn with_reserved_quota(mut self, quota: u32) -> Self {
        self.reserved_quota = quota;
        self
    }

    /// Set the capacity this bucket lends to its band's shared pool.
    pub fn with_shared_quota(mut self, quota: u32) -> Self {
        self.shared_quota = quota;
        self
    }

    /// Set the bucket's share of dequeues within its band. `0` means the
    /// bucket is only ever served from reserved quota.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// The built-in bucket used when no binding matches a request.
    pub fn catch_all(shared_quota: u32) -> Self {
        Self::new(CATCH_ALL_BUCKET, PriorityBand::Lowest).with_shared_quota(shared_quota)
    }

    pub fn is_catch_all(&self) -> bool {
        self.name == CATCH_ALL_BUCKET
    }
}

/// Subject attribute a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RuleField {
    UserName,
    /// Satisfied when any of the user's groups is listed.
    UserGroups,
    Namespace,
    Name,
    Verb,
    ApiGroup,
    ApiVersion,
    Resource,
    Subresource,
    TenantName,
    TenantWorkspace,
    TenantCluster,
    Path,
}

impl RuleField {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleField::UserName => "user.name",
            RuleField::UserGroups => "user.groups",
            RuleField::Namespace => "namespace",
            RuleField::Name => "name",
            RuleField::Verb => "verb",
            RuleField::ApiGroup => "apiGroup",
            RuleField::ApiVersion => "apiVersion",
            RuleField::Resource => "resource",
            RuleField::Subresource => "subresource",
            RuleField::TenantName => "tenant.name",
            RuleField::TenantWorkspace => "tenant.workspace",
            RuleField::TenantCluster => "tenant.cluster",
            RuleField::Path => "path",
        }
    }
}

impl fmt::Display for RuleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s {
            "user.name" => RuleField::UserName,
            "user.groups" => RuleField::UserGroups,
            "namespace" => RuleField::Namespace,
            "name" => RuleField::Name,
            "verb" => RuleField::Verb,
            "apiGroup" => RuleField::ApiGroup,
            "apiVersion" => RuleField::ApiVersion,
            "resource" => RuleField::Resource,
            "subresource" => RuleField::Subresource,
            "tenant.name" => RuleField::TenantName,
            "tenant.workspace" => RuleField::TenantWorkspace,
            "tenant.cluster" => RuleField::TenantCluster,
            "path" => RuleField::Path,
            other => return Err(ConfigError::UnknownRuleField(other.to_string())),
        };
        Ok(field)
    }
}

impl TryFrom<String> for RuleField {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RuleField> for String {
    fn from(field: RuleField) -> Self {
        field.as_str().to_string()
    }
}

/// One match condition: the field must equal any of `values`.
///
/// An empty `values` list can never be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub field: RuleField,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Rule {
    pub fn new<I, V>(field: RuleField, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self { field, values: values.into_iter().map(Into::into).collect() }
    }
}

/// Routes matching requests to a bucket. All rules must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketBinding {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Name of the referenced bucket.
    pub bucket: String,
}

impl BucketBinding {
    pub fn new(name: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self { name: name.into(), rules: Vec::new(), bucket: bucket.into() }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_all_defaults() {
        let extra = Bucket::catch_all(DEFAULT_CATCH_ALL_SHARED_QUOTA);
        assert_eq!(extra.name, "extra");
        assert_eq!(extra.priority, PriorityBand::Lowest);
        assert_eq!(extra.weight, 1);
        assert_eq!(extra.reserved_quota, 0);
        assert!(extra.shared_quota > 0);
        assert!(extra.is_catch_all());
    }

    #[test]
    fn binding_decodes_from_json() {
        let raw = r#"{
            "name": "system-nodes",
            "bucket": "nodes",
            "rules": [
                {"field": "user.groups", "values": ["system:nodes"]},
                {"field": "verb", "values": ["get", "list", "watch"]}
            ]
        }"#;
        let binding: BucketBinding = serde_json::from_str(raw).unwrap();
        assert_eq!(binding.bucket, "nodes");
        assert_eq!(binding.rules.len(), 2);
        assert_eq!(binding.rules[0].field, RuleField::UserGroups);
        assert_eq!(binding.rules[1].values, vec!["get", "list", "watch"]);
    }

    #[test]
    fn bucket_decodes_with_defaults() {
        let raw = r#"{"name": "nodes", "priority": "High", "reservedQuota": 5}"#;
        let bucket: Bucket = serde_json::from_str(raw).unwrap();
        assert_eq!(bucket.reserved_quota, 5);
        assert_eq!(bucket.shared_quota, 0);
        assert_eq!(bucket.weight, 0);
        assert_eq!(bucket.priority, PriorityBand::High);
    }

    #[test]
    fn unknown_rule_field_is_rejected() {
        let raw = r#"{"field": "user.email", "values": ["a"]}"#;
        assert!(serde_json::from_str::<Rule>(raw).is_err());
        assert!(matches!(
            "user.email".parse::<RuleField>(),
            Err(ConfigError::UnknownRuleField(_))
        ));
    }

    #[test]
    fn lowest_priority_is_rejected_in_configuration() {
        let raw = r#"{"name": "sneaky", "priority": "Lowest"}"#;
        assert!(serde_json::from_str::<Bucket>(raw).is_err());
    }

    #[test]
    fn catch_all_survives_serde() {
        let extra = Bucket::catch_all(DEFAULT_CATCH_ALL_SHARED_QUOTA);
        let encoded = serde_json::to_string(&extra).unwrap();
        assert!(encoded.contains(r#""priority":"Lowest""#), "{encoded}");
        let decoded: Bucket = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, extra);

        let nodes = Bucket::new("nodes", PriorityBand::Low).with_reserved_quota(3).with_weight(2);
        let decoded: Bucket = serde_json::from_str(&serde_json::to_string(&nodes).unwrap()).unwrap();
        assert_eq!(decoded, nodes);
    }
}
