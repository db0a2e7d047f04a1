//! Per-attempt usage records.
//!
//! The gateway reports every backend attempt, including failed ones, to a
//! [`UsageSink`]. Hosts that keep an audit table plug in their own sink.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error_code", rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failed(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub model: String,
    /// Flow that issued the call.
    pub caller: &'static str,
    pub owner: Option<String>,
    /// Zero-based attempt number within one gateway call.
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: CallOutcome,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == CallOutcome::Success
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Must not fail; sinks log their own errors.
    async fn record(&self, record: UsageRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: UsageRecord) {}
}

/// Emits each record as a `planwright::usage` tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: UsageRecord) {
        let error_code = match record.outcome {
            CallOutcome::Success => "",
            CallOutcome::Failed(code) => code,
        };
        tracing::info!(
            target: "planwright::usage",
            model = %record.model,
            caller = record.caller,
            owner = record.owner.as_deref().unwrap_or("anonymous"),
            attempt = record.attempt,
            error_code,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            latency_ms = record.latency_ms,
            "backend call"
        );
    }
}

/// Keeps records in memory. Used by tests and short-lived tools that
/// report totals at exit.
#[derive(Debug, Default)]
pub struct CollectingUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl CollectingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// (input, output) tokens over successful attempts.
    pub fn total_tokens(&self) -> (u64, u64) {
        self.records()
            .iter()
            .filter(|r| r.succeeded())
            .fold((0, 0), |(i, o), r| {
                (i + u64::from(r.input_tokens), o + u64::from(r.output_tokens))
            })
    }
}

#[async_trait]
impl UsageSink for CollectingUsageSink {
    async fn record(&self, record: UsageRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(_) => tracing::warn!("usage sink poisoned; dropping record"),
        }
    }
}
