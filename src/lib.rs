#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketgate
//!
//! Bucket-based admission control for HTTP control-plane servers.
//!
//! Every request is classified into a quota *bucket* by the first matching
//! binding, queued fairly across buckets of the same priority band, and
//! admitted once reserved or shared quota is free. Requests are rejected with
//! `409 Conflict` when the backlog is full or their wait times out.
//!
//! ## Features
//!
//! - **Six priority bands** served strictly in order, with shared quota
//!   borrowed downward from lower bands
//! - **Weighted round-robin** across buckets within a band
//! - **Signed-delta quota reconciliation** on live configuration changes
//! - **Tower middleware** over `http::Request`/`http::Response`
//! - **Pluggable telemetry** through `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use bucketgate::{AdmissionControl, Bucket, BucketBinding, InMemoryConfigSource, PriorityBand};
//! use bucketgate::{Rule, RuleField};
//! use http::{Request, Response};
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let source = Arc::new(InMemoryConfigSource::new());
//!     source.apply_bucket(Bucket::new("reads", PriorityBand::High).with_shared_quota(8));
//!     source.apply_binding(
//!         BucketBinding::new("all-reads", "reads")
//!             .with_rule(Rule::new(RuleField::Verb, ["get", "list"])),
//!     );
//!
//!     let control = AdmissionControl::builder(source).build();
//!     let tasks = control.spawn();
//!
//!     let svc = control.layer().layer(service_fn(|_req: Request<String>| async {
//!         Ok::<_, Infallible>(Response::new(String::from("ok")))
//!     }));
//!     let response = svc.oneshot(Request::new(String::new())).await.unwrap();
//!     assert!(response.headers().contains_key("x-bucket-queue-latency"));
//!     tasks.abort();
//! }
//! ```

pub mod bucket;
pub mod config;
pub mod control;
pub mod drainer;
pub mod error;
pub mod filter;
pub mod matcher;
pub mod prelude;
pub mod priority;
pub mod quota;
pub mod snapshot;
pub mod source;
pub mod subject;
pub mod telemetry;
pub mod watcher;
pub mod wrr;

// Re-exports
pub use bucket::{Bucket, BucketBinding, Rule, RuleField, CATCH_ALL_BUCKET};
pub use config::{AdmissionConfig, AdmissionConfigError};
pub use control::{AdmissionControl, AdmissionControlBuilder, AdmissionTasks};
pub use drainer::{Admission, DrainOutcome, QueueDrainer};
pub use error::{AdmissionError, ConfigError};
pub use filter::{AdmissionLayer, AdmissionService};
pub use priority::PriorityBand;
pub use quota::{QuotaPermit, QuotaSource, QuotaTracker};
pub use snapshot::{ConfigSnapshot, LiveSnapshot};
pub use source::{ConfigEvent, ConfigSource, InMemoryConfigSource, WatchEvent};
pub use subject::{Subject, TenantInfo, UserInfo};
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use watcher::ConfigWatcher;
pub use wrr::WrrQueue;
