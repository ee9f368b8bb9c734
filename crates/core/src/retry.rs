use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{StorageError, StorageResult};

/// Message fragments that mark a failure as transient regardless of its code.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "network",
    "socket hang up",
];

const RETRYABLE_STATUSES: &[u16] = &[429, 502, 503, 504];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Error codes treated as transient whatever their message says.
    pub retryable_errors: BTreeSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let retryable_errors = [
            "ConnectionReset",
            "ConnectionAborted",
            "TimedOut",
            "BrokenPipe",
            "Interrupted",
            "ECONNRESET",
            "ETIMEDOUT",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            retryable_errors,
        }
    }
}

impl RetryConfig {
    /// Single attempt, never sleeps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            ..Self::default()
        }
    }

    pub fn with_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_errors.insert(code.into());
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.max_attempts < 1 {
            return Err(StorageError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_delay_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "retry.initial_delay_ms must be positive".into(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(StorageError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) is below retry.initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(StorageError::InvalidConfig(format!(
                "retry.backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay(),
            max: self.max_delay(),
            multiplier: self.backoff_multiplier.max(1.0),
        }
    }
}

/// Endless, non-decreasing sequence of delays capped at the configured maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max)
            .max(current);
        Some(current)
    }
}

/// What the classifier needs to know about a failure.
pub trait Classify {
    fn code(&self) -> Option<&str> {
        None
    }

    fn status(&self) -> Option<u16> {
        None
    }

    fn message(&self) -> String;
}

impl Classify for StorageError {
    fn code(&self) -> Option<&str> {
        StorageError::code(self)
    }

    fn status(&self) -> Option<u16> {
        StorageError::status(self)
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

impl Classify for std::io::Error {
    fn code(&self) -> Option<&str> {
        Some(crate::error::io_kind_code(self.kind()))
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

impl Classify for anyhow::Error {
    fn code(&self) -> Option<&str> {
        if let Some(err) = self.downcast_ref::<StorageError>() {
            return err.code();
        }
        self.downcast_ref::<std::io::Error>()
            .map(|err| crate::error::io_kind_code(err.kind()))
    }

    fn status(&self) -> Option<u16> {
        self.downcast_ref::<StorageError>()
            .and_then(StorageError::status)
    }

    fn message(&self) -> String {
        format!("{self:#}")
    }
}

pub fn is_retryable<E: Classify + ?Sized>(error: &E, config: &RetryConfig) -> bool {
    if let Some(code) = error.code()
        && config.retryable_errors.contains(code)
    {
        return true;
    }
    if let Some(status) = error.status()
        && RETRYABLE_STATUSES.contains(&status)
    {
        return true;
    }
    let message = error.message().to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` is reached. The last error is returned on exhaustion.
pub async fn with_retry<T, E, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    label: Option<&str>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
{
    let label = label.unwrap_or("storage operation");
    let max_attempts = config.max_attempts.max(1);
    let mut delays = config.backoff();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err, config) {
                    debug!(label, attempt, error = %err.message(), "non-retryable failure");
                    return Err(err);
                }
                if attempt >= max_attempts {
                    error!(label, attempts = attempt, error = %err.message(), "retries exhausted");
                    return Err(err);
                }
                let delay = delays.next().unwrap_or_else(|| config.max_delay());
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message(),
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn transient() -> StorageError {
        StorageError::Transient {
            code: "ECONNRESET".into(),
            message: "peer went away".into(),
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 250,
            backoff_multiplier: 2.0,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_uses_every_attempt() {
        let mut calls = 0;
        let result: Result<(), _> = with_retry(
            || {
                calls += 1;
                async { Err(transient()) }
            },
            &fast_config(3),
            Some("upload"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_fails_fast() {
        let mut calls = 0;
        let result: Result<(), _> = with_retry(
            || {
                calls += 1;
                async { Err(StorageError::NotFound("doc-1".into())) }
            },
            &fast_config(3),
            None,
        )
        .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failures() {
        let mut calls = 0;
        let started = tokio::time::Instant::now();
        let result = with_retry(
            || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        Err(transient())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            &fast_config(5),
            Some("download"),
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        // 100ms then 200ms, nothing after the final attempt.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn no_delay_after_final_attempt() {
        let started = tokio::time::Instant::now();
        let result: Result<(), _> =
            with_retry(|| async { Err(transient()) }, &fast_config(4), None).await;
        assert!(result.is_err());
        // 100 + 200 + 250 (capped).
        assert_eq!(started.elapsed(), Duration::from_millis(550));
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let config = RetryConfig {
            initial_delay_ms: 30,
            max_delay_ms: 1_000,
            backoff_multiplier: 1.7,
            ..RetryConfig::default()
        };
        let delays: Vec<_> = config.backoff().take(20).collect();
        assert_eq!(delays[0], Duration::from_millis(30));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= config.max_delay()));
        assert_eq!(*delays.last().unwrap(), config.max_delay());
    }

    #[test]
    fn multiplier_of_one_keeps_delay_flat() {
        let config = RetryConfig {
            backoff_multiplier: 1.0,
            ..RetryConfig::default()
        };
        assert!(config.backoff().take(5).all(|d| d == config.initial_delay()));
    }

    #[test]
    fn classifier_checks_codes_messages_and_statuses() {
        let config = RetryConfig::default();

        assert!(is_retryable(&transient(), &config));
        assert!(is_retryable(
            &StorageError::Backend("request timeout after 30s".into()),
            &config
        ));
        assert!(is_retryable(
            &StorageError::Stream("Network unreachable".into()),
            &config
        ));
        for status in [429, 502, 503, 504] {
            let err = StorageError::Http {
                status,
                message: "upstream".into(),
            };
            assert!(is_retryable(&err, &config), "status {status}");
        }

        assert!(!is_retryable(
            &StorageError::Http {
                status: 500,
                message: "internal".into()
            },
            &config
        ));
        assert!(!is_retryable(&StorageError::NotFound("x".into()), &config));
        assert!(!is_retryable(
            &StorageError::InvalidRange {
                start: 5,
                end: 1,
                size: 10
            },
            &config
        ));
    }

    #[test]
    fn simulated_faults_retry_only_when_configured() {
        let err = StorageError::Simulated {
            operation: "download",
        };
        assert!(!is_retryable(&err, &RetryConfig::default()));
        let config = RetryConfig::default().with_retryable_code(crate::error::SIMULATED_CODE);
        assert!(is_retryable(&err, &config));
    }

    #[test]
    fn classifier_sees_through_anyhow_context() {
        let config = RetryConfig::default();
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        let wrapped: anyhow::Error = Err::<(), _>(io)
            .context("writing upload body")
            .unwrap_err();
        assert!(is_retryable(&wrapped, &config));

        let plain = anyhow::anyhow!("permission denied");
        assert!(!is_retryable(&plain, &config));
    }

    #[test]
    fn config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::no_retry().validate().is_ok());
        let zero = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(zero.validate().is_err());
        let shrinking = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(shrinking.validate().is_err());
        let inverted = RetryConfig {
            initial_delay_ms: 500,
            max_delay_ms: 100,
            ..RetryConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.initial_delay_ms, RetryConfig::default().initial_delay_ms);
        assert!(config.retryable_errors.contains("ConnectionReset"));
    }
}
