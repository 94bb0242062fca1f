//! Convenient re-exports for common bucketgate types.
pub use crate::{
    bucket::{Bucket, BucketBinding, Rule, RuleField},
    config::AdmissionConfig,
    control::{AdmissionControl, AdmissionTasks},
    error::{AdmissionError, ConfigError},
    filter::AdmissionLayer,
    priority::PriorityBand,
    source::{ConfigSource, InMemoryConfigSource},
    subject::{TenantInfo, UserInfo},
    telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink},
};
