// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for timing, notification and shipping.

use reqwest::StatusCode;
use thiserror::Error;

use crate::collector::PayloadClass;

/// A duration was requested before both ends of the interval were known.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum IncompleteTimingError {
    #[error("incomplete timing: start time is not set")]
    MissingStart,
    #[error("incomplete timing: end time is not set")]
    MissingEnd,
}

/// Returned synchronously by the notifier's `notify_*` methods.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("APM is disabled, {0} will not be sent")]
    Disabled(PayloadClass),
    #[error("APM is closed, {0} will not be sent")]
    Closed(PayloadClass),
    #[error(transparent)]
    IncompleteTiming(#[from] IncompleteTimingError),
}

/// Outcome of a failed PUT to the collector.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("unauthorized: project id or key is invalid")]
    Authorization,
    #[error("rate limited by the collector")]
    RateLimited,
    #[error("transient failure with status {0}")]
    TransientStatus(StatusCode),
    #[error("transient network failure: {0}")]
    Network(#[source] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SendError {
    /// Whether the payload should be kept for a later retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::TransientStatus(_) | SendError::Network(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("invalid blocklist pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            IncompleteTimingError::MissingEnd.to_string(),
            "incomplete timing: end time is not set"
        );
        assert_eq!(
            NotifyError::Disabled(PayloadClass::RouteStats).to_string(),
            "APM is disabled, routes stats will not be sent"
        );
        assert_eq!(
            SendError::TransientStatus(StatusCode::BAD_GATEWAY).to_string(),
            "transient failure with status 502 Bad Gateway"
        );
        assert_eq!(
            ConfigError::Missing("APM_PROJECT_KEY").to_string(),
            "APM_PROJECT_KEY environment variable is not set"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(SendError::TransientStatus(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(!SendError::Authorization.is_transient());
        assert!(!SendError::RateLimited.is_transient());
        assert!(!SendError::UnexpectedStatus {
            status: StatusCode::IM_A_TEAPOT,
            body: String::new(),
        }
        .is_transient());
    }

    #[test]
    fn test_incomplete_timing_converts() {
        let err: NotifyError = IncompleteTimingError::MissingStart.into();
        assert_eq!(
            err,
            NotifyError::IncompleteTiming(IncompleteTimingError::MissingStart)
        );
    }
}
