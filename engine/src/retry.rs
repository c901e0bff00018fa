//! Bounded retry around opaque generation calls
//!
//! Each attempt runs under the configured hard timeout; a timeout counts as a
//! transient failure. Only retryable errors are attempted again, with
//! exponential backoff. When the budget is spent the last transient error is
//! surfaced as [`EngineError::ContentGeneration`].

use crate::config::GenerationConfig;
use crate::errors::{EngineError, Result};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Run `operation` with the generation retry policy.
///
/// `label` names the step in logs and in the exhausted-budget error.
pub async fn with_retry<T, F, Fut>(cfg: &GenerationConfig, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = AtomicUsize::new(0);
    let call_timeout = cfg.call_timeout();

    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(cfg.initial_backoff_ms))
        .with_max_delay(Duration::from_millis(cfg.max_backoff_ms))
        .with_factor(cfg.backoff_multiplier as f32)
        .with_max_times(cfg.max_attempts.saturating_sub(1));

    let attempt = || {
        attempts.fetch_add(1, Ordering::Relaxed);
        let call = operation();
        async move {
            match tokio::time::timeout(call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::transient(format!(
                    "{label} timed out after {}s",
                    call_timeout.as_secs()
                ))),
            }
        }
    };

    let result = attempt
        .retry(backoff)
        .when(EngineError::is_retryable)
        .notify(|err: &EngineError, delay: Duration| {
            tracing::warn!(
                step = label,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Generation step failed, retrying"
            );
        })
        .await;

    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_retryable() => {
            let attempts = attempts.load(Ordering::Relaxed);
            tracing::warn!(step = label, attempts, error = %err, "Generation retry budget exhausted");
            Err(EngineError::content_generation(format!("{label}: {err}"), attempts))
        }
        Err(err) => Err(err),
    }
}
