//! Batch task generation and single-task update.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::parser::{
    self, AlignedPatch, AlignmentError, ProposalError, Record, UnparseableOutputError,
};
use crate::pipeline::{GenerationPipeline, GenerationRequest, PipelineError};
use crate::prompts::{PromptContext, TemplateId};
use crate::reconcile::{
    reconcile_created, reconcile_updated, Defaults, ReconciledResult, TaskPatch, TaskRecord,
};

/// Turn a free-form request into new tasks and changes to `existing`.
pub async fn generate_tasks(
    pipeline: &GenerationPipeline,
    request: &str,
    existing: &[TaskRecord],
    owner: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ReconciledResult, PipelineError> {
    let context = PromptContext::new()
        .with("user_request", request)
        .with("current_time", now.to_rfc3339_opts(SecondsFormat::Secs, true))
        .with_json("existing_tasks", &existing_for_prompt(existing))?;

    let req = GenerationRequest::new(TemplateId::Create, context).owner(owner);
    let outcome = pipeline
        .generate_with(&req, |raw| {
            parser::parse_create_update(raw, existing).map_err(PipelineError::from)
        })
        .await?;

    let proposal = outcome.value;
    let (created, mut skipped) = reconcile_created(proposal.created, Defaults::default(), now);
    let (updated, update_skipped) = reconcile_updated(proposal.updated, existing, now);
    skipped.extend(proposal.skipped);
    skipped.extend(update_skipped);
    skipped.sort_by_key(|s| (s.side as u8, s.index));

    tracing::info!(
        invocation = %outcome.invocation_id,
        created = created.len(),
        updated = updated.len(),
        skipped = skipped.len(),
        "task generation reconciled"
    );

    Ok(ReconciledResult {
        created,
        updated,
        skipped,
    })
}

/// Apply one natural-language instruction to `task`.
///
/// Returns `None` when the model proposes no change.
pub async fn update_task(
    pipeline: &GenerationPipeline,
    task: &TaskRecord,
    request: &str,
    owner: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<TaskPatch>, PipelineError> {
    let context = PromptContext::new()
        .with("user_request", request)
        .with_json("original_task", task)?;

    let req = GenerationRequest::new(TemplateId::Update, context).owner(owner);
    let outcome = pipeline
        .generate_with(&req, |raw| -> Result<Record, ProposalError> {
            let fields = parser::parse(raw)?
                .into_records()
                .into_iter()
                .next()
                .ok_or_else(|| UnparseableOutputError::new(raw))?;
            if let Some(id) = parser::echoed_id(&fields).filter(|id| *id != task.id) {
                return Err(ProposalError::from(AlignmentError::UnknownId { index: 0, id }));
            }
            Ok(fields)
        })
        .await?;

    let aligned = AlignedPatch {
        index: 0,
        target: 0,
        fields: outcome.value,
    };
    let (mut patches, _) = reconcile_updated(vec![aligned], std::slice::from_ref(task), now);
    Ok(patches.pop())
}

/// The subset of each task the model needs to decide on updates.
fn existing_for_prompt(existing: &[TaskRecord]) -> Vec<serde_json::Value> {
    existing
        .iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id,
                "title": t.title,
                "description": t.description,
                "status": t.status,
                "priority": t.priority,
                "planned_date": t.planned_date,
            })
        })
        .collect()
}
