use crate::backends::LlmBackend;
use crate::types::{LlmRequest, LlmResponse};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Retry behaviour for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Whether an error is transient and worth retrying.
///
/// Rate limits (429), server errors (5xx) and timeouts are retryable. Client
/// errors such as 400 are not.
pub fn is_retryable(err: &ForemanError) -> bool {
    match err {
        ForemanError::Http(_) | ForemanError::Llm(_) => {}
        _ => return false,
    }
    let lower = err.to_string().to_lowercase();

    if lower.contains("400") {
        return false;
    }

    lower.contains("429")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
}

/// Wraps several backends: each is retried on transient errors, then the next
/// one is tried. The last error is returned when every backend fails.
pub struct FailoverBackend {
    backends: Vec<Box<dyn LlmBackend>>,
    policy: RetryPolicy,
}

impl FailoverBackend {
    /// Create a failover backend over `backends`, tried in order.
    pub fn new(backends: Vec<Box<dyn LlmBackend>>, policy: RetryPolicy) -> Self {
        Self { backends, policy }
    }
}

#[async_trait]
impl LlmBackend for FailoverBackend {
    async fn complete(&self, request: &LlmRequest) -> ForemanResult<LlmResponse> {
        let mut last_err: Option<ForemanError> = None;

        for (backend_idx, backend) in self.backends.iter().enumerate() {
            for attempt in 0..=self.policy.max_retries {
                match backend.complete(request).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if !is_retryable(&e) {
                            warn!(
                                backend = backend_idx,
                                attempt,
                                error = %e,
                                "Non-retryable LLM error, moving to next backend"
                            );
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = self.policy.backoff(attempt);
                            info!(
                                backend = backend_idx,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Retryable LLM error, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ForemanError::Llm("No LLM backends configured".into())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct MockBackend {
        responses: Mutex<VecDeque<ForemanResult<LlmResponse>>>,
    }

    impl MockBackend {
        fn new(responses: Vec<ForemanResult<LlmResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for MockBackend {
        async fn complete(&self, _request: &LlmRequest) -> ForemanResult<LlmResponse> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ForemanError::Llm("mock exhausted".into())))
        }
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&ForemanError::Http("429 Too Many Requests".into())));
        assert!(is_retryable(&ForemanError::Http("503 Service Unavailable".into())));
        assert!(is_retryable(&ForemanError::Llm("request timed out".into())));
        assert!(!is_retryable(&ForemanError::Http("400 Bad Request".into())));
        assert!(!is_retryable(&ForemanError::Config("500".into())));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_try() {
        let failover = FailoverBackend::new(
            vec![Box::new(MockBackend::new(vec![
                Err(ForemanError::Http("429 Too Many Requests".into())),
                Ok(LlmResponse::text("ok")),
            ]))],
            instant_policy(),
        );

        let resp = failover.complete(&LlmRequest::default()).await.unwrap();
        assert_eq!(resp.content_text(), "ok");
    }

    #[tokio::test]
    async fn all_backends_fail_returns_last_error() {
        let failing = |msg: &str| -> Vec<ForemanResult<LlmResponse>> {
            (0..4).map(|_| Err(ForemanError::Http(msg.to_string()))).collect()
        };
        let failover = FailoverBackend::new(
            vec![
                Box::new(MockBackend::new(failing("500 Internal Server Error"))),
                Box::new(MockBackend::new(failing("503 Service Unavailable"))),
            ],
            instant_policy(),
        );

        let err = failover.complete(&LlmRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("503"), "got: {err}");
    }

    #[tokio::test]
    async fn non_retryable_moves_to_next_backend() {
        let failover = FailoverBackend::new(
            vec![
                Box::new(MockBackend::new(vec![
                    Err(ForemanError::Http("400 Bad Request".into())),
                    Ok(LlmResponse::text("should not reach")),
                ])),
                Box::new(MockBackend::new(vec![Ok(LlmResponse::text("fallback ok"))])),
            ],
            instant_policy(),
        );

        let resp = failover.complete(&LlmRequest::default()).await.unwrap();
        assert_eq!(resp.content_text(), "fallback ok");
    }
}
