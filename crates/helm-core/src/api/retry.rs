use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{
    ApiError, GenerateContext, GenerateResult, Message, ModelClient, ToolChoice, ToolSpec,
};
use crate::retry::{RetryOutcome, RetryPolicy};

/// Retries `Transient` generate failures of the wrapped client. Once the
/// attempts are spent the last error is surfaced as `RetriesExhausted`,
/// which is `Permanent`.
pub struct RetryingClient {
    inner: Arc<dyn ModelClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn ModelClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ModelClient for RetryingClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        ctx: &GenerateContext,
        history: &[Message],
        tools: &[ToolSpec],
        tool_choice: ToolChoice,
    ) -> Result<GenerateResult, ApiError> {
        let outcome = self
            .policy
            .run(&ctx.cancel, ApiError::is_retryable, |attempt| {
                let choice = tool_choice.clone();
                async move {
                    let result = self.inner.generate(ctx, history, tools, choice).await;
                    if let Err(error) = &result
                        && error.is_retryable()
                    {
                        warn!(
                            target: "helm::api",
                            run_id = %ctx.run_id,
                            provider = self.inner.name(),
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            error = %error,
                            "Model request failed, retrying"
                        );
                    }
                    result
                }
            })
            .await;

        match outcome {
            RetryOutcome::Done(result) => Ok(result),
            RetryOutcome::Failed(error) => Err(error),
            RetryOutcome::Exhausted { attempts, last } => Err(ApiError::RetriesExhausted {
                provider: self.inner.name().to_string(),
                attempts,
                last: Box::new(last),
            }),
            RetryOutcome::Cancelled => Err(ApiError::Cancelled {
                provider: self.inner.name().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StopReason;
    use crate::types::RunId;
    use helm_tools::ErrorKind;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Flaky {
        failures: Mutex<Vec<ApiError>>,
    }

    #[async_trait]
    impl ModelClient for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(
            &self,
            _ctx: &GenerateContext,
            _history: &[Message],
            _tools: &[ToolSpec],
            _tool_choice: ToolChoice,
        ) -> Result<GenerateResult, ApiError> {
            let next = self.failures.lock().unwrap().pop();
            match next {
                Some(error) => Err(error),
                None => Ok(GenerateResult::Stop(StopReason::EndTurn)),
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    fn ctx() -> GenerateContext {
        GenerateContext::new(RunId::from("r"), CancellationToken::new())
    }

    fn rate_limited() -> ApiError {
        ApiError::RateLimited {
            provider: "flaky".into(),
            details: "429".into(),
        }
    }

    #[tokio::test]
    async fn recovers_from_transient_failures() {
        let client = RetryingClient::new(
            Arc::new(Flaky {
                failures: Mutex::new(vec![rate_limited(), rate_limited()]),
            }),
            policy(3),
        );
        let result = client
            .generate(&ctx(), &[], &[], ToolChoice::Auto)
            .await
            .unwrap();
        assert!(matches!(result, GenerateResult::Stop(StopReason::EndTurn)));
    }

    #[tokio::test]
    async fn exhausted_retries_become_permanent() {
        let client = RetryingClient::new(
            Arc::new(Flaky {
                failures: Mutex::new(vec![rate_limited(), rate_limited()]),
            }),
            policy(2),
        );
        let err = client
            .generate(&ctx(), &[], &[], ToolChoice::Auto)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(matches!(err, ApiError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn rejected_requests_are_not_retried() {
        let client = RetryingClient::new(
            Arc::new(Flaky {
                failures: Mutex::new(vec![
                    rate_limited(),
                    ApiError::Rejected {
                        provider: "flaky".into(),
                        details: "policy".into(),
                    },
                ]),
            }),
            policy(5),
        );
        let err = client
            .generate(&ctx(), &[], &[], ToolChoice::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Rejected { .. }));
    }
}
