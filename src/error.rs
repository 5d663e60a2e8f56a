//! Error types and retry backoff
//!
//! Typed errors for the HTTP surface plus the backoff policy that drives every
//! reconnection loop in the relay (the change-feed watcher and the monitor client).

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::model::ValidationError;

/// Backoff policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Maximum number of retry attempts, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Retry forever, doubling from `initial_delay` up to `max_delay`.
    /// A zero `initial_delay` is raised to one millisecond.
    pub fn unbounded(initial_delay: Duration, max_delay: Duration) -> Self {
        let initial_delay = initial_delay.max(Duration::from_millis(1));
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            ..Default::default()
        }
    }

    /// Fixed one-second reconnects, five attempts
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(1),
            max_attempts: Some(5),
        }
    }

    /// Start a fresh backoff sequence
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempts: 0,
            current: self.initial_delay,
        }
    }
}

/// Stateful delay sequence produced by a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    /// Delay to wait before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        self.attempts = self.attempts.saturating_add(1);
        let delay = self.current.min(self.policy.max_delay);

        let scaled = self.current.as_secs_f64() * self.policy.backoff_multiplier.max(1.0);
        self.current = Duration::from_secs_f64(scaled.min(self.policy.max_delay.as_secs_f64()));

        Some(delay)
    }

    /// Attempts handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.policy.initial_delay;
    }
}

/// Errors surfaced by the HTTP API
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Internal {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl RelayError {
    pub fn internal(context: &'static str, source: anyhow::Error) -> Self {
        Self::Internal { context, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) | RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            RelayError::Internal { context, source } => {
                tracing::error!(error = %source, "{}", context);
                ErrorBody {
                    success: false,
                    message: (*context).to_string(),
                    error: Some(source.to_string()),
                }
            }
            other => ErrorBody {
                success: false,
                message: other.to_string(),
                error: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_non_decreasing_up_to_cap() {
        let policy = BackoffPolicy::unbounded(Duration::from_secs(2), Duration::from_secs(30));
        let mut backoff = policy.backoff();

        let delays: Vec<Duration> = (0..50).map(|_| backoff.next_delay().unwrap()).collect();

        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn zero_initial_delay_still_backs_off() {
        let policy = BackoffPolicy::unbounded(Duration::ZERO, Duration::from_secs(1));
        let mut backoff = policy.backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        assert!(backoff.next_delay().unwrap() > Duration::from_millis(1));
    }

    #[test]
    fn unbounded_backoff_never_gives_up() {
        let mut backoff = BackoffPolicy::default().backoff();
        for _ in 0..10_000 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.attempts(), 10_000);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = BackoffPolicy::default().backoff();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn bounded_policy_stops_after_max_attempts() {
        let mut backoff = BackoffPolicy::reconnect().backoff();
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        }
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(
            RelayError::NotFound("Order not found".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::internal("Error fetching orders", anyhow::anyhow!("db down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
