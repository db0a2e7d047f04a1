//! Orchestrator: cache key, lookup, render, generate, parse, cache write.
//!
//! Every task flow goes through [`GenerationPipeline::generate_with`]. The
//! flow supplies a parser; only responses that parse (and are not degraded)
//! are written back to the cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::{CacheError, CacheRecord, ResponseCache, ResponseCacheKey, SqliteResponseCache};
use crate::gateway::{Attribution, ChatGateway};
use crate::generation::{GenerationClient, GenerationParams, DEFAULT_REQUEST_BUDGET};
use crate::parser::{self, AlignmentError, ParsedResult, ProposalError, UnparseableOutputError};
use crate::prompts::{self, PromptContext, PromptError, TemplateId};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TTL_MINUTES: i64 = 60;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub model: String,
    /// Cache window for requests that do not set their own.
    pub ttl_minutes: i64,
    pub params: GenerationParams,
    pub request_budget: Duration,
    /// SQLite cache file; `None` runs without a cache.
    pub cache_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            ttl_minutes: DEFAULT_TTL_MINUTES,
            params: GenerationParams::default(),
            request_budget: DEFAULT_REQUEST_BUDGET,
            cache_path: None,
        }
    }
}

impl PipelineConfig {
    /// Read overrides from the environment.
    ///
    /// `OPENAI_MODEL`, `PLANWRIGHT_TTL_MINUTES`,
    /// `PLANWRIGHT_REQUEST_BUDGET_SECONDS`; the cache lives at
    /// `PLANWRIGHT_CACHE_PATH` or the default path.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let model = std::env::var("OPENAI_MODEL")
            .ok()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or(defaults.model);

        let ttl_minutes = std::env::var("PLANWRIGHT_TTL_MINUTES")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.ttl_minutes);

        let request_budget = std::env::var("PLANWRIGHT_REQUEST_BUDGET_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_budget);

        Self {
            model,
            ttl_minutes,
            params: defaults.params,
            request_budget,
            cache_path: Some(SqliteResponseCache::default_path()),
        }
    }
}

// =============================================================================
// Request / outcome
// =============================================================================

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub template: TemplateId,
    pub context: PromptContext,
    /// `None` uses the pipeline default; `<= 0` bypasses the cache.
    pub ttl_minutes: Option<i64>,
    pub params: Option<GenerationParams>,
    pub model: Option<String>,
    /// Principal for audit; not part of the cache key.
    pub owner: Option<String>,
}

impl GenerationRequest {
    pub fn new(template: TemplateId, context: PromptContext) -> Self {
        Self {
            template,
            context,
            ttl_minutes: None,
            params: None,
            model: None,
            owner: None,
        }
    }

    pub fn ttl_minutes(mut self, ttl: i64) -> Self {
        self.ttl_minutes = Some(ttl);
        self
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn owner(mut self, owner: Option<&str>) -> Self {
        self.owner = owner.map(str::to_string);
        self
    }
}

/// Result of one orchestrated call.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    /// Model text the value was parsed from.
    pub raw: String,
    pub reasoning: Option<String>,
    pub from_cache: bool,
    pub degraded: bool,
    pub invocation_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("could not understand the generated plan")]
    Unparseable(#[from] UnparseableOutputError),
    #[error("generated update does not match the existing tasks: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),
}

impl From<ProposalError> for PipelineError {
    fn from(err: ProposalError) -> Self {
        match err {
            ProposalError::Unparseable(e) => PipelineError::Unparseable(e),
            ProposalError::Alignment(e) => PipelineError::Alignment(e),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Clone)]
pub struct GenerationPipeline {
    client: GenerationClient,
    cache: Option<Arc<dyn ResponseCache>>,
    config: PipelineConfig,
}

impl GenerationPipeline {
    pub fn new(client: GenerationClient, config: PipelineConfig) -> Self {
        Self {
            client,
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build a pipeline over `gateway`, opening the SQLite cache if configured.
    pub fn from_config(
        gateway: Arc<dyn ChatGateway>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let client = GenerationClient::new(gateway).with_budget(config.request_budget);
        let cache = match &config.cache_path {
            Some(path) => Some(Arc::new(SqliteResponseCache::new(path)?) as Arc<dyn ResponseCache>),
            None => None,
        };
        Ok(Self {
            client,
            cache,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Free-form text. A degraded transport yields the apology with
    /// `degraded = true`.
    pub async fn generate_text(
        &self,
        req: &GenerationRequest,
    ) -> Result<Outcome<String>, PipelineError> {
        self.generate_with(req, |text| Ok::<_, PipelineError>(text.to_string()))
            .await
    }

    /// Structured output via the multi-strategy parser.
    pub async fn generate_structured(
        &self,
        req: &GenerationRequest,
    ) -> Result<Outcome<ParsedResult>, PipelineError> {
        self.generate_with(req, parser::parse).await
    }

    /// Run one request end to end with a caller-supplied parser.
    pub async fn generate_with<T, E, F>(
        &self,
        req: &GenerationRequest,
        parse: F,
    ) -> Result<Outcome<T>, PipelineError>
    where
        F: Fn(&str) -> Result<T, E>,
        E: Into<PipelineError>,
    {
        let invocation_id = Uuid::new_v4();
        let model = req.model.as_deref().unwrap_or(&self.config.model);
        let ttl = req.ttl_minutes.unwrap_or(self.config.ttl_minutes);
        let params = req.params.unwrap_or(self.config.params);

        let prompt = prompts::render(req.template, &req.context);
        let key = ResponseCacheKey::new(&prompt.text, model);
        let cache = self.cache.as_ref().filter(|_| ttl > 0);

        if let Some(cache) = cache {
            match cache.get(&key.request_hash, ttl).await {
                Ok(Some(record)) => match parse(&record.response_text) {
                    Ok(value) => {
                        tracing::debug!(
                            invocation = %invocation_id,
                            template = prompt.template_slug,
                            "cache hit"
                        );
                        return Ok(Outcome {
                            value,
                            raw: record.response_text,
                            reasoning: record.reasoning_trace,
                            from_cache: true,
                            degraded: false,
                            invocation_id,
                        });
                    }
                    Err(_) => tracing::warn!(
                        invocation = %invocation_id,
                        template = prompt.template_slug,
                        "cached response no longer parses; regenerating"
                    ),
                },
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    invocation = %invocation_id,
                    error = %err,
                    "cache lookup failed; continuing without cache"
                ),
            }
        }

        let attribution = Attribution::new(req.template.slug()).with_owner(req.owner.as_deref());
        let generation = self
            .client
            .invoke(&prompt.text, model, params, attribution)
            .await;

        let value = match parse(&generation.content) {
            Ok(value) => value,
            Err(err) => {
                let err: PipelineError = err.into();
                tracing::warn!(
                    invocation = %invocation_id,
                    template = prompt.template_slug,
                    degraded = generation.degraded,
                    error = %err,
                    "generated output rejected"
                );
                return Err(err);
            }
        };

        if let Some(cache) = cache.filter(|_| !generation.degraded) {
            let record = CacheRecord::new(
                &key,
                prompt.text.as_str(),
                generation.content.as_str(),
                generation.reasoning.clone(),
                req.owner.as_deref(),
            );
            if let Err(err) = cache.put(&record).await {
                tracing::warn!(invocation = %invocation_id, error = %err, "cache write failed");
            }
        }

        tracing::info!(
            invocation = %invocation_id,
            template = prompt.template_slug,
            model,
            degraded = generation.degraded,
            "generation complete"
        );

        Ok(Outcome {
            value,
            raw: generation.content,
            reasoning: generation.reasoning,
            from_cache: false,
            degraded: generation.degraded,
            invocation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_message_is_user_facing() {
        let err = PipelineError::from(UnparseableOutputError::new("nope"));
        assert_eq!(err.to_string(), "could not understand the generated plan");
    }

    #[test]
    fn proposal_errors_map_to_pipeline_errors() {
        let err = PipelineError::from(ProposalError::Alignment(AlignmentError::UnknownId {
            index: 0,
            id: 5,
        }));
        assert!(matches!(err, PipelineError::Alignment(_)));
    }

    #[test]
    fn request_builder_overrides() {
        let req = GenerationRequest::new(TemplateId::Plan, PromptContext::new())
            .ttl_minutes(0)
            .model("deepseek-chat")
            .owner(Some("u1"));
        assert_eq!(req.ttl_minutes, Some(0));
        assert_eq!(req.model.as_deref(), Some("deepseek-chat"));
        assert_eq!(req.owner.as_deref(), Some("u1"));
    }
}
