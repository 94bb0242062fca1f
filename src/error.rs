//! Error types for admission and configuration.
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Why a request was not admitted.
///
/// Both variants are expected outcomes under load and surface to the caller as
/// `409 Conflict`; the `Display` text is used verbatim as the response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The bounded queue already holds the maximum number of waiters.
    #[error("too many queuing inflight requests")]
    QueueFull { outstanding: usize, max: usize },
    /// The waiter was not granted quota within the wait timeout.
    #[error("inflight rate-limit timeout")]
    Timeout { waited: Duration, timeout: Duration },
}

impl AdmissionError {
    /// HTTP status reported for this rejection.
    pub fn status(&self) -> StatusCode {
        StatusCode::CONFLICT
    }

    /// Check if the queue was full.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    /// Check if the wait timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Access queue capacity info as (outstanding, max).
    pub fn queue_capacity(&self) -> Option<(usize, usize)> {
        match self {
            Self::QueueFull { outstanding, max } => Some((*outstanding, *max)),
            _ => None,
        }
    }

    /// Access timeout details as (waited, timeout).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { waited, timeout } => Some((*waited, *timeout)),
            _ => None,
        }
    }
}

/// Errors raised while decoding configuration or talking to a configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Priority name is not one of the configurable bands.
    #[error("unknown priority band `{0}`")]
    UnknownPriority(String),
    /// Rule field name is not a supported subject attribute.
    #[error("unknown rule field `{0}`")]
    UnknownRuleField(String),
    /// The configuration source failed to list or watch objects.
    #[error("configuration source error: {0}")]
    Source(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_bodies_are_verbatim() {
        let full = AdmissionError::QueueFull { outstanding: 1000, max: 1000 };
        assert_eq!(full.to_string(), "too many queuing inflight requests");
        assert_eq!(full.status(), StatusCode::CONFLICT);

        let timeout = AdmissionError::Timeout {
            waited: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(timeout.to_string(), "inflight rate-limit timeout");
        assert_eq!(timeout.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn accessors_return_expected_data() {
        let full = AdmissionError::QueueFull { outstanding: 3, max: 3 };
        assert!(full.is_queue_full());
        assert!(!full.is_timeout());
        assert_eq!(full.queue_capacity(), Some((3, 3)));
        assert!(full.timeout_details().is_none());

        let timeout = AdmissionError::Timeout {
            waited: Duration::from_millis(10),
            timeout: Duration::from_millis(20),
        };
        assert!(timeout.is_timeout());
        assert_eq!(
            timeout.timeout_details(),
            Some((Duration::from_millis(10), Duration::from_millis(20)))
        );
        assert!(timeout.queue_capacity().is_none());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::UnknownRuleField("user.email".into());
        assert!(err.to_string().contains("user.email"));
        let err = ConfigError::Source("list failed".into());
        assert!(err.to_string().contains("list failed"));
    }
}
