//! Admission configuration.

use crate::bucket::DEFAULT_CATCH_ALL_SHARED_QUOTA;
use http::HeaderName;
use std::time::Duration;
use thiserror::Error;

/// Default ceiling on waiters queued across all bands.
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 1000;
/// Default time a request may wait for quota.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default upper bound on how long the drainer sleeps when nothing is ready.
pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Default response header carrying the queuing latency.
pub const DEFAULT_LATENCY_HEADER: &str = "x-bucket-queue-latency";

/// Errors produced when validating admission configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionConfigError {
    /// Queue ceiling must be > 0.
    #[error("max_queue_length must be > 0")]
    InvalidQueueLength,
    /// Wait timeout must be > 0 and finite.
    #[error("wait_timeout must be non-zero and finite (got {0:?})")]
    InvalidWaitTimeout(Duration),
    /// Idle poll interval must be > 0.
    #[error("idle_poll_interval must be > 0")]
    InvalidPollInterval,
    /// Header name is not a valid HTTP header name.
    #[error("invalid latency header name `{0}`")]
    InvalidHeader(String),
}

/// Validated configuration for the admission filter and drainer.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    max_queue_length: usize,
    wait_timeout: Duration,
    idle_poll_interval: Duration,
    latency_header: HeaderName,
    catch_all_shared_quota: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
            latency_header: HeaderName::from_static(DEFAULT_LATENCY_HEADER),
            catch_all_shared_quota: DEFAULT_CATCH_ALL_SHARED_QUOTA,
        }
    }
}

impl AdmissionConfig {
    /// Create a config with validation.
    pub fn new(
        max_queue_length: usize,
        wait_timeout: Duration,
        idle_poll_interval: Duration,
    ) -> Result<Self, AdmissionConfigError> {
        Self::default()
            .with_max_queue_length(max_queue_length)?
            .with_wait_timeout(wait_timeout)?
            .with_idle_poll_interval(idle_poll_interval)
    }

    pub fn with_max_queue_length(mut self, max: usize) -> Result<Self, AdmissionConfigError> {
        if max == 0 {
            return Err(AdmissionConfigError::InvalidQueueLength);
        }
        self.max_queue_length = max;
        Ok(self)
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Result<Self, AdmissionConfigError> {
        if timeout.is_zero() || timeout == Duration::MAX {
            return Err(AdmissionConfigError::InvalidWaitTimeout(timeout));
        }
        self.wait_timeout = timeout;
        Ok(self)
    }

    pub fn with_idle_poll_interval(
        mut self,
        interval: Duration,
    ) -> Result<Self, AdmissionConfigError> {
        if interval.is_zero() {
            return Err(AdmissionConfigError::InvalidPollInterval);
        }
        self.idle_poll_interval = interval;
        Ok(self)
    }

    pub fn with_latency_header(mut self, name: &str) -> Result<Self, AdmissionConfigError> {
        self.latency_header = HeaderName::try_from(name)
            .map_err(|_| AdmissionConfigError::InvalidHeader(name.to_string()))?;
        Ok(self)
    }

    pub fn with_catch_all_shared_quota(mut self, quota: u32) -> Self {
        self.catch_all_shared_quota = quota;
        self
    }

    /// Waiters allowed in the queue before enqueue is rejected.
    pub fn max_queue_length(&self) -> usize {
        self.max_queue_length
    }

    /// How long a request waits for quota before a timeout rejection.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Longest idle sleep of the drainer between passes.
    pub fn idle_poll_interval(&self) -> Duration {
        self.idle_poll_interval
    }

    pub fn latency_header(&self) -> &HeaderName {
        &self.latency_header
    }

    /// Shared quota of the built-in catch-all bucket.
    pub fn catch_all_shared_quota(&self) -> u32 {
        self.catch_all_shared_quota
    }
}
