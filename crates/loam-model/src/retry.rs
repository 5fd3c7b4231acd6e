use async_trait::async_trait;
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use loam_core::{LoamError, Result};

use crate::client::{ModelClient, ModelTurn, TurnRequest};

/// Decorator adding bounded exponential backoff around a transport.
///
/// Only transport-level failures are retried; malformed model output is
/// returned to the caller immediately. After the attempt budget is spent
/// the last transport error surfaces, which ends the session as `fail`
/// with reason=transport.
pub struct RetryingClient {
    inner: Arc<dyn ModelClient>,
    max_retries: u32,
    backoff_base: Duration,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn ModelClient>, max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            inner,
            max_retries,
            backoff_base,
        }
    }

    fn backoff_for(&self, attempt: u32, err: &LoamError) -> Duration {
        if let LoamError::RateLimited { retry_after_secs } = err {
            return Duration::from_secs(*retry_after_secs);
        }
        // Exponential backoff with up to 25% jitter
        let base = self.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::rng().random_range(0..=exp / 4 + 1);
        Duration::from_millis(exp + jitter)
    }
}

#[async_trait]
impl ModelClient for RetryingClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn turn(&self, request: &TurnRequest) -> Result<ModelTurn> {
        let mut attempt = 0u32;
        loop {
            match self.inner.turn(request).await {
                Ok(turn) => return Ok(turn),
                Err(e) if e.is_transport() && attempt < self.max_retries => {
                    let delay = self.backoff_for(attempt, &e);
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transport error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockModel, MockTurn};

    fn request() -> TurnRequest {
        TurnRequest {
            model: "test".into(),
            messages: vec![],
            tools: vec![],
            system: None,
            max_tokens: 256,
            temperature: 0.0,
            stop_conditions: vec![],
        }
    }

    #[tokio::test]
    async fn test_retries_transport_then_succeeds() {
        let mock = MockModel::new("mock")
            .with_transport_error("connection reset")
            .with_text("recovered");
        let client = RetryingClient::new(Arc::new(mock), 2, Duration::from_millis(1));
        let turn = client.turn(&request()).await.unwrap();
        assert_eq!(turn.text(), "recovered");
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let mock = MockModel::new("mock")
            .with_transport_error("down")
            .with_transport_error("down")
            .with_transport_error("down");
        let client = RetryingClient::new(Arc::new(mock), 2, Duration::from_millis(1));
        let err = client.turn(&request()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_non_transport_errors_not_retried() {
        let mock = MockModel::new("mock")
            .with_turn(MockTurn::malformed("not json"))
            .with_text("never reached");
        let client = RetryingClient::new(Arc::new(mock), 3, Duration::from_millis(1));
        let err = client.turn(&request()).await.unwrap_err();
        assert!(matches!(err, LoamError::ModelOutput(_)));
    }
}
