#![forbid(unsafe_code)]

//! # planwright
//!
//! The generation layer of a personal productivity dashboard: turn a
//! free-form request into a cached, structured, reconciled result from a
//! non-deterministic text model.
//!
//! A request flows through the [`pipeline`]: the rendered prompt and model
//! are hashed into a cache key, a fresh cached response is reused, otherwise
//! the [`generation`] client calls the model through a [`gateway`]. The
//! [`parser`] pulls JSON out of whatever prose the model wrapped it in, and
//! [`reconcile`] turns the JSON into typed task drafts and patches that the
//! caller persists. [`tasks`], [`decompose`], [`schedule`] and [`insights`]
//! are the flows built on top.

pub mod cache;
pub mod decompose;
pub mod gateway;
pub mod generation;
pub mod insights;
pub mod parser;
pub mod pipeline;
pub mod prompts;
pub mod reconcile;
pub mod schedule;
pub mod tasks;

pub use cache::{
    CacheRecord, MemoryResponseCache, ResponseCache, ResponseCacheKey, SqliteResponseCache,
};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use generation::{Generation, GenerationClient, GenerationParams, DEGRADED_RESPONSE};
pub use parser::{parse, parse_create_update, AlignmentError, ParsedResult, UnparseableOutputError};
pub use pipeline::{GenerationPipeline, GenerationRequest, PipelineConfig, PipelineError};
pub use prompts::{render, PromptContext, TemplateId};
pub use reconcile::{
    ReconciledResult, SkippedItem, TaskDraft, TaskPatch, TaskPriority, TaskRecord, TaskStatus,
};
