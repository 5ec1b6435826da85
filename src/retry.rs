//! Exponential backoff for internally retried write conflicts

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::Result;

/// Delay schedule between attempts. Attempts are unbounded.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    multiplier: u32,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: u32, max: Duration) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1),
            max: max.max(base),
        }
    }

    /// Delay before the `attempt`-th retry (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.multiplier);
            if delay >= self.max {
                return self.max;
            }
        }
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

/// Run `op` until it finishes without a write conflict.
///
/// Each attempt must redo its own reads; the closure is invoked afresh.
/// Any error other than [`RegistryError::WriteConflict`](crate::RegistryError::WriteConflict)
/// is returned immediately.
pub async fn retry_on_conflict<T, F, Fut>(backoff: &Backoff, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(e) if e.is_write_conflict() => {
                let delay = backoff.delay(attempt);
                debug!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(6));
        assert_eq!(backoff.delay(0), Duration::from_millis(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(2));
        assert_eq!(backoff.delay(2), Duration::from_millis(4));
        assert_eq!(backoff.delay(3), Duration::from_millis(6));
        assert_eq!(backoff.delay(40), Duration::from_millis(6));
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let attempts = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(4));

        let value = retry_on_conflict(&backoff, "test", || {
            let attempts = &attempts;
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(RegistryError::conflict("k"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&Backoff::default(), "test", || {
            let attempts = &attempts;
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::not_found("group", "g"))
            }
        })
        .await;

        assert!(matches!(result, Err(RegistryError::DataNotFound { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
