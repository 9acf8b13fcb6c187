use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LatticeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// The single call/response capability every component talks to.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt, format: ResponseFormat) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            call_timeout: Duration::from_secs(120),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// One model call bounded by `timeout`; expiry becomes `LatticeError::Timeout`.
pub async fn complete_with_timeout(
    model: &dyn LanguageModel,
    prompt: &Prompt,
    format: ResponseFormat,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, model.complete(prompt, format)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(model = model.name(), timeout_ms = timeout.as_millis() as u64, "Model call timed out");
            Err(LatticeError::Timeout(timeout))
        }
    }
}

/// Retries transient failures with exponential backoff. Non-transient errors
/// and the last transient error are returned as-is.
pub async fn complete_with_retry(
    model: &dyn LanguageModel,
    prompt: &Prompt,
    format: ResponseFormat,
    policy: &RetryPolicy,
) -> Result<String> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match complete_with_timeout(model, prompt, format, policy.call_timeout).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.backoff_for(attempt);
                debug!(
                    model = model.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient model failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        transient: bool,
    }

    #[async_trait]
    impl LanguageModel for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _prompt: &Prompt, _format: ResponseFormat) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.transient {
                    Err(LatticeError::ModelUnavailable("overloaded".into()))
                } else {
                    Err(LatticeError::Model("bad request".into()))
                }
            } else {
                Ok("ok".into())
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl LanguageModel for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _prompt: &Prompt, _format: ResponseFormat) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".into())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            call_timeout: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let model = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            transient: true,
        };
        let out = complete_with_retry(&model, &Prompt::new("hi"), ResponseFormat::Text, &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let model = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            transient: true,
        };
        let err = complete_with_retry(&model, &Prompt::new("hi"), ResponseFormat::Text, &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LatticeError::ModelUnavailable(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_failures() {
        let model = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            transient: false,
        };
        let err = complete_with_retry(&model, &Prompt::new("hi"), ResponseFormat::Text, &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LatticeError::Model(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_surface_as_timeout_errors() {
        let err = complete_with_timeout(&Slow, &Prompt::new("hi"), ResponseFormat::Text, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LatticeError::Timeout(_)));
    }
}
