//! Break one task into an ordered chain of subtasks.
//!
//! Decomposition never fails on bad model output: an unusable response falls
//! back to a generic three-step breakdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parser::{self, Record, UnparseableOutputError};
use crate::pipeline::{GenerationPipeline, GenerationRequest, PipelineError};
use crate::prompts::{PromptContext, TemplateId};
use crate::reconcile::{reconcile_created, Defaults, TaskDraft, TaskRecord, TaskStatus};

/// Most subtasks kept from one response.
pub const MAX_SUBTASKS: usize = 5;

/// Steps in the generic breakdown used when generation is unusable.
pub const FALLBACK_STEPS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub subtasks: Vec<TaskDraft>,
    /// True when `subtasks` is the generic breakdown.
    pub fallback: bool,
}

pub async fn decompose_task(
    pipeline: &GenerationPipeline,
    parent: &TaskRecord,
    requirements: Option<&str>,
    owner: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Decomposition, PipelineError> {
    let planned_time = parent
        .planned_start_time
        .map(|t| t.to_rfc3339())
        .or_else(|| parent.planned_date.map(|d| d.to_string()));

    let context = PromptContext::new()
        .with("title", parent.title.as_str())
        .with_opt("description", parent.description.as_deref())
        .with("priority", parent.priority.as_str())
        .with_opt("planned_time", planned_time)
        .with_opt("user_requirements", requirements);

    let req = GenerationRequest::new(TemplateId::Decompose, context).owner(owner);
    match pipeline
        .generate_with(&req, |raw| usable_subtasks(raw, parent, now))
        .await
    {
        Ok(outcome) if !outcome.degraded => Ok(Decomposition {
            subtasks: outcome.value,
            fallback: false,
        }),
        Ok(_) | Err(PipelineError::Unparseable(_)) => {
            tracing::warn!(task_id = parent.id, "decomposition unusable; using generic steps");
            Ok(fallback(parent, now))
        }
        Err(err) => Err(err),
    }
}

/// A response with no titled subtask is rejected like unparseable output, so
/// the pipeline never caches it.
fn usable_subtasks(
    raw: &str,
    parent: &TaskRecord,
    now: DateTime<Utc>,
) -> Result<Vec<TaskDraft>, UnparseableOutputError> {
    let subtasks = subtasks_from(parser::parse(raw)?.into_records(), parent, now);
    if subtasks.is_empty() {
        return Err(UnparseableOutputError::new(raw));
    }
    Ok(subtasks)
}

fn subtasks_from(records: Vec<Record>, parent: &TaskRecord, now: DateTime<Utc>) -> Vec<TaskDraft> {
    let defaults = Defaults {
        status: TaskStatus::Pending,
        priority: parent.priority,
    };
    let (drafts, skipped) = reconcile_created(records, defaults, now);
    if !skipped.is_empty() {
        tracing::debug!(task_id = parent.id, skipped = skipped.len(), "dropped untitled subtasks");
    }

    drafts
        .into_iter()
        .take(MAX_SUBTASKS)
        .map(|mut draft| {
            draft.status = TaskStatus::Pending;
            draft.completed_at = None;
            draft
        })
        .collect()
}

/// Generic `"<title> - step N"` breakdown.
pub fn fallback(parent: &TaskRecord, now: DateTime<Utc>) -> Decomposition {
    let subtasks = (1..=FALLBACK_STEPS)
        .map(|n| TaskDraft {
            title: format!("{} - step {n}", parent.title),
            description: Some(format!("Step {n} of {FALLBACK_STEPS} for \"{}\"", parent.title)),
            status: TaskStatus::Pending,
            priority: parent.priority,
            planned_date: parent.planned_date,
            planned_start_time: None,
            planned_end_time: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
        .collect();

    Decomposition {
        subtasks,
        fallback: true,
    }
}
