//! Cross-cutting error classification.
//!
//! Raw errors from backends, adapters, and stores are mapped onto a small
//! set of *classes* that drive retry policy, circuit breakers, and
//! dead-lettering.  Classification is a pure function of the error's shape
//! (HTTP status, message markers); it never inspects concrete error types,
//! so any subsystem can feed it.

use serde::{Deserialize, Serialize};

// ─── ErrorClass ──────────────────────────────────────────────────────────────

/// Retry-relevant classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retriable as-is (5xx, resets, refused connections).
    Transient,
    /// Not retriable (4xx, auth, validation).
    Permanent,
    /// Retriable with a higher timeout.
    Timeout,
    /// Retriable after a cooldown (rate limits, exhausted pools).
    Resource,
    /// Unclassifiable; retried once, then treated as permanent.
    Unknown,
}

impl ErrorClass {
    /// Whether this class counts toward a circuit breaker's failure counter.
    /// Permanent failures propagate without tripping the breaker.
    pub fn trips_breaker(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }

    /// Whether the worker may schedule another attempt for this class.
    /// `Unknown` is retriable exactly once; the worker enforces that cap.
    pub fn is_retriable(self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::Resource => write!(f, "resource"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}

// ─── ClassifiedError ─────────────────────────────────────────────────────────

/// An error message paired with its classification, as recorded on jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Classify a raw error message (no status code available).
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify(None, &message),
            message,
        }
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

// ─── classify ────────────────────────────────────────────────────────────────

/// Message markers that indicate a timeout regardless of status code.
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded", "abort"];

/// Message markers that indicate resource exhaustion.
const RESOURCE_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "out of memory",
    "disk full",
    "no space left",
    "semaphore",
];

/// Message markers that indicate a transient network condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "temporary failure in name resolution",
    "dns",
];

/// Classify a failure from an optional HTTP status and its message.
///
/// Status codes take precedence over message markers; among markers,
/// timeout beats resource beats transient (the more specific condition
/// wins when a message matches several).
pub fn classify(status: Option<u16>, message: &str) -> ErrorClass {
    if let Some(code) = status {
        match code {
            408 | 504 => return ErrorClass::Timeout,
            429 => return ErrorClass::Resource,
            502 | 503 | 529 => return ErrorClass::Transient,
            400 | 401 | 403 | 404 | 405 | 409 | 422 => return ErrorClass::Permanent,
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    if TIMEOUT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Timeout;
    }
    if RESOURCE_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Resource;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Transient;
    }
    if lower.contains("authentication")
        || lower.contains("unauthorized")
        || lower.contains("bad request")
        || lower.contains("validation")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_drive_classification() {
        assert_eq!(classify(Some(429), ""), ErrorClass::Resource);
        assert_eq!(classify(Some(502), ""), ErrorClass::Transient);
        assert_eq!(classify(Some(503), ""), ErrorClass::Transient);
        assert_eq!(classify(Some(529), ""), ErrorClass::Transient);
        assert_eq!(classify(Some(408), ""), ErrorClass::Timeout);
        assert_eq!(classify(Some(504), ""), ErrorClass::Timeout);
        assert_eq!(classify(Some(401), ""), ErrorClass::Permanent);
        assert_eq!(classify(Some(422), ""), ErrorClass::Permanent);
    }

    #[test]
    fn unknown_status_falls_back_to_message() {
        assert_eq!(
            classify(Some(500), "connection reset by peer"),
            ErrorClass::Transient
        );
    }

    #[test]
    fn timeout_markers_beat_other_markers() {
        // A message mentioning both a timeout and a connection issue is a timeout.
        assert_eq!(
            classify(None, "connection reset after timeout"),
            ErrorClass::Timeout
        );
    }

    #[test]
    fn resource_markers_classify_resource() {
        assert_eq!(classify(None, "rate limit exceeded"), ErrorClass::Resource);
        assert_eq!(classify(None, "disk full"), ErrorClass::Resource);
        assert_eq!(
            classify(None, "semaphore acquire gave up"),
            ErrorClass::Resource
        );
    }

    #[test]
    fn unmatched_message_is_unknown() {
        assert_eq!(classify(None, "something odd happened"), ErrorClass::Unknown);
    }

    #[test]
    fn permanent_does_not_trip_breaker() {
        assert!(!ErrorClass::Permanent.trips_breaker());
        assert!(ErrorClass::Transient.trips_breaker());
        assert!(ErrorClass::Timeout.trips_breaker());
        assert!(ErrorClass::Resource.trips_breaker());
        assert!(ErrorClass::Unknown.trips_breaker());
    }

    #[test]
    fn classified_error_display_includes_class() {
        let err = ClassifiedError::new(ErrorClass::Timeout, "deadline exceeded");
        assert_eq!(format!("{err}"), "[timeout] deadline exceeded");
    }

    #[test]
    fn from_message_classifies() {
        let err = ClassifiedError::from_message("429 too many requests");
        assert_eq!(err.class, ErrorClass::Resource);
    }
}
