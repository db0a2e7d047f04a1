//! Daily scheduling: lay tasks out inside a working-hour window.
//!
//! The plan is returned as the model produced it. Times are not checked for
//! overlaps or against the window.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::parser::{self, UnparseableOutputError};
use crate::pipeline::{GenerationPipeline, GenerationRequest, PipelineError};
use crate::prompts::{PromptContext, TemplateId};
use crate::reconcile::TaskRecord;

/// Cache window for plans; a plan for the same tasks is reused for half a day.
pub const PLAN_TTL_MINUTES: i64 = 720;

// =============================================================================
// Working hours
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid working hours '{0}': expected HH:MM-HH:MM with start before end")]
pub struct WorkingHoursError(pub String);

impl WorkingHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, WorkingHoursError> {
        if start >= end {
            return Err(WorkingHoursError(format!(
                "{}-{}",
                start.format("%H:%M"),
                end.format("%H:%M")
            )));
        }
        Ok(Self { start, end })
    }
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl fmt::Display for WorkingHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

impl FromStr for WorkingHours {
    type Err = WorkingHoursError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || WorkingHoursError(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(err)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| err())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| err())?;
        Self::new(start, end).map_err(|_| err())
    }
}

// =============================================================================
// Plan
// =============================================================================

/// Accept ids the model writes as numbers or strings.
fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Minutes as a number or numeric string; anything else is dropped.
fn lenient_minutes<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .and_then(|m| u32::try_from(m).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledBlock {
    #[serde(default, alias = "task_id", deserialize_with = "lenient_id")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "start_time")]
    pub start_time: String,
    #[serde(default, alias = "end_time")]
    pub end_time: String,
    #[serde(default, deserialize_with = "lenient_minutes")]
    pub duration: Option<u32>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakBlock {
    #[serde(default, alias = "start_time")]
    pub start_time: String,
    #[serde(default, alias = "end_time")]
    pub end_time: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnscheduledTask {
    #[serde(default, alias = "task_id", deserialize_with = "lenient_id")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPlan {
    #[serde(default)]
    pub schedule: Vec<ScheduledBlock>,
    #[serde(default)]
    pub breaks: Vec<BreakBlock>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub unscheduled: Vec<UnscheduledTask>,
    /// Anything else the model returned.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parse a plan from model text. Anything other than a single plan object is
/// unparseable.
pub fn parse_plan(raw: &str) -> Result<DailyPlan, UnparseableOutputError> {
    let obj = parser::parse(raw)?
        .into_single()
        .ok_or_else(|| UnparseableOutputError::new(raw))?;
    if !obj.contains_key("schedule") {
        return Err(UnparseableOutputError::new(raw));
    }
    serde_json::from_value(Value::Object(obj)).map_err(|e| {
        tracing::debug!(error = %e, "plan object has unexpected shape");
        UnparseableOutputError::new(raw)
    })
}

/// Ask the model to lay `tasks` out within `hours`.
pub async fn plan_day(
    pipeline: &GenerationPipeline,
    request: &str,
    tasks: &[TaskRecord],
    hours: WorkingHours,
    owner: Option<&str>,
) -> Result<DailyPlan, PipelineError> {
    let context = PromptContext::new()
        .with("user_request", request)
        .with("time_range", hours.to_string())
        .with_json("tasks", &tasks)?;

    let req = GenerationRequest::new(TemplateId::Plan, context)
        .ttl_minutes(PLAN_TTL_MINUTES)
        .owner(owner);
    let outcome = pipeline.generate_with(&req, parse_plan).await?;

    tracing::info!(
        invocation = %outcome.invocation_id,
        scheduled = outcome.value.schedule.len(),
        unscheduled = outcome.value.unscheduled.len(),
        from_cache = outcome.from_cache,
        "daily plan ready"
    );
    Ok(outcome.value)
}
