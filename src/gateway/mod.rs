//! Text-generation transport.
//!
//! [`ChatGateway`] is the seam the rest of the crate depends on.
//! [`ProviderGateway`] is the production implementation: an OpenAI-compatible
//! client with bounded retries and per-attempt usage records.

pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use openai::OpenAiAdapter;
use usage::{CallOutcome, UsageRecord};

pub use error::{ErrorContext, ProviderError};
pub use types::{Attribution, ChatRequest, ChatResponse, FinishReason, Message, Role};
pub use usage::{CollectingUsageSink, NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on any single wait, including a backend's `Retry-After`.
    pub max_retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
        }
    }
}

pub struct ProviderGateway {
    adapter: OpenAiAdapter,
    usage: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

impl ProviderGateway {
    pub fn new(adapter: OpenAiAdapter, usage: Arc<dyn UsageSink>) -> Self {
        Self::with_config(adapter, usage, GatewayConfig::default())
    }

    pub fn with_config(
        adapter: OpenAiAdapter,
        usage: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            adapter,
            usage,
            config,
        }
    }

    pub fn from_env(usage: Arc<dyn UsageSink>) -> Result<Self, ProviderError> {
        Ok(Self::new(OpenAiAdapter::from_env()?, usage))
    }

    fn delay_for(&self, attempt: u32, err: &ProviderError) -> Duration {
        let backoff = self.config.retry_base_delay * 2u32.pow(attempt.min(5));
        err.retry_after()
            .unwrap_or(backoff)
            .min(self.config.max_retry_delay)
    }

    async fn report(
        &self,
        req: &ChatRequest,
        attempt: u32,
        result: &Result<ChatResponse, ProviderError>,
        started: Instant,
    ) {
        let (outcome, input_tokens, output_tokens) = match result {
            Ok(resp) => (CallOutcome::Success, resp.input_tokens, resp.output_tokens),
            Err(err) => (CallOutcome::Failed(err.code()), 0, 0),
        };
        self.usage
            .record(UsageRecord {
                model: req.model.clone(),
                caller: req.attribution.caller,
                owner: req.attribution.owner.clone(),
                attempt,
                outcome,
                input_tokens,
                output_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
                at: Utc::now(),
            })
            .await;
    }
}

#[async_trait::async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = self.adapter.complete(&req).await;
            self.report(&req, attempt, &result, started).await;

            match result {
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.delay_for(attempt, &err);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = err.code(),
                        request_id = err.request_id().unwrap_or(""),
                        "retrying backend call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
