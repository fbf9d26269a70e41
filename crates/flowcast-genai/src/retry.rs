use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use flowcast_core::config::RetryConfig;
use flowcast_core::error::{FlowError, Result};
use flowcast_core::event::EventBus;
use flowcast_core::traits::GenerationClient;
use flowcast_core::types::*;

/// Retries quota failures after a fixed cool-down.
///
/// `Attempt(n)` either succeeds, fails fatally (any non-quota error, never
/// retried), or hits quota. Quota below the attempt bound sleeps the fixed
/// cool-down and tries again; at the bound it surfaces `FlowError::Quota`
/// carrying the number of attempts made.
#[derive(Clone)]
pub struct QuotaRetry {
    config: RetryConfig,
    events: Option<Arc<EventBus>>,
}

impl QuotaRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Run `op` until it succeeds, fails fatally, or exhausts the attempt bound.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(label, attempt, "Request succeeded after quota cool-down");
                    }
                    return Ok(value);
                }
                Err(FlowError::Quota { message, .. }) if attempt < max_attempts => {
                    let cooldown = self.config.cooldown();
                    warn!(
                        label,
                        attempt,
                        max_attempts,
                        cooldown_secs = cooldown.as_secs(),
                        error = %message,
                        "Quota exhausted, cooling down"
                    );
                    if let Some(ref events) = self.events {
                        events.publish(EngineEvent::QuotaCooldown {
                            attempt,
                            max_attempts,
                            cooldown_secs: cooldown.as_secs(),
                        });
                    }
                    tokio::time::sleep(cooldown).await;
                    attempt += 1;
                }
                Err(FlowError::Quota { message, .. }) => {
                    warn!(label, attempts = attempt, "Quota retries exhausted");
                    return Err(FlowError::Quota {
                        attempts: attempt,
                        message,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A generation client whose `generate` calls go through [`QuotaRetry`].
pub struct RetryingClient {
    inner: Arc<dyn GenerationClient>,
    retry: QuotaRetry,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn GenerationClient>, retry: QuotaRetry) -> Self {
        Self { inner, retry }
    }

    pub fn inner(&self) -> &Arc<dyn GenerationClient> {
        &self.inner
    }
}

impl GenerationClient for RetryingClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<GenerateResponse>> {
        Box::pin(async move {
            let label = request.model.clone();
            self.retry
                .run(&label, |_| self.inner.generate(request.clone()))
                .await
        })
    }

    fn operation_status(&self, operation_id: String) -> BoxFuture<'_, Result<OperationStatus>> {
        self.inner.operation_status(operation_id)
    }

    fn upload(
        &self,
        file_name: String,
        mime: String,
        bytes: Vec<u8>,
    ) -> BoxFuture<'_, Result<String>> {
        self.inner.upload(file_name, mime, bytes)
    }

    fn fetch_asset(&self, uri: String) -> BoxFuture<'_, Result<Vec<u8>>> {
        self.inner.fetch_asset(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_test_utils::MockGenerationClient;

    fn quota() -> FlowError {
        FlowError::Quota {
            attempts: 1,
            message: "RESOURCE_EXHAUSTED".into(),
        }
    }

    fn count_cooldowns(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> usize {
        let mut n = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::QuotaCooldown { .. }) {
                n += 1;
            }
        }
        n
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_fifth_attempt_after_four_cooldowns() {
        let mock = Arc::new(MockGenerationClient::new());
        for _ in 0..4 {
            mock.push_response(Err(quota()));
        }
        mock.push_response(Ok(GenerateResponse::text("done")));

        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let client = RetryingClient::new(
            mock.clone(),
            QuotaRetry::new(RetryConfig::default()).with_events(events),
        );

        let started = tokio::time::Instant::now();
        let response = client
            .generate(GenerateRequest::default())
            .await
            .unwrap();

        assert_eq!(response.text.as_deref(), Some("done"));
        assert_eq!(mock.generate_calls().len(), 5);
        assert_eq!(count_cooldowns(&mut rx), 4);
        assert_eq!(started.elapsed().as_secs(), 4 * 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_bound() {
        let retry = QuotaRetry::new(RetryConfig {
            max_attempts: 3,
            cooldown_secs: 5,
        });
        let mut calls = 0;
        let result: Result<()> = retry
            .run("test", |_| {
                calls += 1;
                async { Err(quota()) }
            })
            .await;
        assert_eq!(calls, 3);
        assert!(matches!(result, Err(FlowError::Quota { attempts: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_quota_error_is_fatal() {
        let retry = QuotaRetry::new(RetryConfig::default());
        let mut calls = 0;
        let result: Result<()> = retry
            .run("test", |_| {
                calls += 1;
                async { Err(FlowError::Transport("HTTP 500".into())) }
            })
            .await;
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(FlowError::Transport(_))));
    }
}
