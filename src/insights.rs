//! Journal summaries and note annotation.
//!
//! Both are best-effort: a failing backend produces placeholder text instead
//! of an error.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parser::{self, UnparseableOutputError};
use crate::pipeline::{GenerationPipeline, GenerationRequest, PipelineError};
use crate::prompts::{PromptContext, TemplateId};

pub const DAILY_SUMMARY_TTL_MINUTES: i64 = 240;
pub const WEEKLY_SUMMARY_TTL_MINUTES: i64 = 10_080;

/// Shown instead of a summary when generation failed.
pub const SUMMARY_UNAVAILABLE: &str = "Summary unavailable right now.";

const NOTE_FALLBACK_CHARS: usize = 100;
const NOTE_FALLBACK_REASON: &str =
    "The note could not be analysed automatically; revisit it to pick out the key points.";

/// One day's journal entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyJournal {
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub failed_tasks: Vec<String>,
    #[serde(default)]
    pub good_things: Vec<String>,
    pub learnings: Option<String>,
    pub challenges: Option<String>,
    pub improvements: Option<String>,
    pub mood: Option<String>,
    pub energy_level: Option<String>,
    pub sleep_quality: Option<String>,
    pub tomorrow_goals: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub text: String,
    pub degraded: bool,
    pub from_cache: bool,
}

async fn summarize(
    pipeline: &GenerationPipeline,
    req: GenerationRequest,
) -> Result<Summary, PipelineError> {
    let outcome = pipeline.generate_text(&req).await?;
    let text = if outcome.degraded || outcome.value.trim().is_empty() {
        SUMMARY_UNAVAILABLE.to_string()
    } else {
        outcome.value
    };
    Ok(Summary {
        text,
        degraded: outcome.degraded,
        from_cache: outcome.from_cache,
    })
}

pub async fn summarize_day(
    pipeline: &GenerationPipeline,
    journal: &DailyJournal,
    owner: Option<&str>,
) -> Result<Summary, PipelineError> {
    let context = PromptContext::new()
        .with_opt("date", journal.date.map(|d| d.to_string()))
        .with("completed_tasks", journal.completed_tasks.clone())
        .with("failed_tasks", journal.failed_tasks.clone())
        .with("good_things", journal.good_things.clone())
        .with_opt("learnings", journal.learnings.clone())
        .with_opt("challenges", journal.challenges.clone())
        .with_opt("improvements", journal.improvements.clone())
        .with_opt("mood", journal.mood.clone())
        .with_opt("energy_level", journal.energy_level.clone())
        .with_opt("sleep_quality", journal.sleep_quality.clone())
        .with_opt("tomorrow_goals", journal.tomorrow_goals.clone());

    let req = GenerationRequest::new(TemplateId::SummarizeDaily, context)
        .ttl_minutes(DAILY_SUMMARY_TTL_MINUTES)
        .owner(owner);
    summarize(pipeline, req).await
}

fn date_span(entries: &[DailyJournal]) -> (Option<String>, Option<String>) {
    let start = entries.iter().filter_map(|e| e.date).min();
    let end = entries.iter().filter_map(|e| e.date).max();
    (start.map(|d| d.to_string()), end.map(|d| d.to_string()))
}

pub async fn summarize_three_days(
    pipeline: &GenerationPipeline,
    entries: &[DailyJournal],
    owner: Option<&str>,
) -> Result<Summary, PipelineError> {
    let mut ordered = entries.to_vec();
    ordered.sort_by_key(|e| e.date);
    let (start, end) = date_span(&ordered);

    let context = PromptContext::new()
        .with_opt("start_date", start)
        .with_opt("end_date", end)
        .with_json("daily_entries", &ordered)?;

    let req = GenerationRequest::new(TemplateId::SummarizeThreeDay, context)
        .ttl_minutes(DAILY_SUMMARY_TTL_MINUTES)
        .owner(owner);
    summarize(pipeline, req).await
}

/// Per-day values as `"<date>: <value>"` lines, skipping empty days.
fn by_day(
    entries: &[DailyJournal],
    pick: impl Fn(&DailyJournal) -> Option<&String>,
) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| {
            let value = pick(e)?.trim();
            if value.is_empty() {
                return None;
            }
            Some(match e.date {
                Some(d) => format!("{d}: {value}"),
                None => value.to_string(),
            })
        })
        .collect()
}

fn every_item(
    entries: &[DailyJournal],
    pick: impl Fn(&DailyJournal) -> &Vec<String>,
) -> Vec<String> {
    entries.iter().flat_map(|e| pick(e).iter().cloned()).collect()
}

/// Non-empty values across days joined with `; `.
fn joined_text(
    entries: &[DailyJournal],
    pick: impl Fn(&DailyJournal) -> Option<&String>,
) -> Option<String> {
    let values: Vec<&str> = entries
        .iter()
        .filter_map(|e| pick(e).map(|s| s.trim()))
        .filter(|s| !s.is_empty())
        .collect();
    (!values.is_empty()).then(|| values.join("; "))
}

pub async fn summarize_week(
    pipeline: &GenerationPipeline,
    entries: &[DailyJournal],
    next_week_goals: Option<&str>,
    owner: Option<&str>,
) -> Result<Summary, PipelineError> {
    let mut ordered = entries.to_vec();
    ordered.sort_by_key(|e| e.date);
    let (start, end) = date_span(&ordered);

    let context = PromptContext::new()
        .with_opt("start_date", start)
        .with_opt("end_date", end)
        .with("completed_tasks", every_item(&ordered, |e| &e.completed_tasks))
        .with("good_things", every_item(&ordered, |e| &e.good_things))
        .with_opt("learnings", joined_text(&ordered, |e| e.learnings.as_ref()))
        .with_opt("challenges", joined_text(&ordered, |e| e.challenges.as_ref()))
        .with_opt("improvements", joined_text(&ordered, |e| e.improvements.as_ref()))
        .with("mood", by_day(&ordered, |e| e.mood.as_ref()))
        .with("energy_level", by_day(&ordered, |e| e.energy_level.as_ref()))
        .with("sleep_quality", by_day(&ordered, |e| e.sleep_quality.as_ref()))
        .with_opt("next_week_goals", next_week_goals);

    let req = GenerationRequest::new(TemplateId::SummarizeWeekly, context)
        .ttl_minutes(WEEKLY_SUMMARY_TTL_MINUTES)
        .owner(owner);
    summarize(pipeline, req).await
}

// =============================================================================
// Notes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSummary {
    pub summary: String,
    pub reason: String,
    pub key_points: Vec<String>,
    /// True when the model output could not be used.
    pub fallback: bool,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_note_summary(raw: &str) -> Result<NoteSummary, UnparseableOutputError> {
    let obj = parser::parse(raw)?
        .into_single()
        .ok_or_else(|| UnparseableOutputError::new(raw))?;
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let summary = text("summary");
    if summary.is_empty() {
        return Err(UnparseableOutputError::new(raw));
    }
    Ok(NoteSummary {
        summary,
        reason: text("reason"),
        key_points: string_list(obj.get("keyPoints").or_else(|| obj.get("key_points"))),
        fallback: false,
    })
}

fn note_fallback(raw: &str) -> NoteSummary {
    NoteSummary {
        summary: raw.trim().chars().take(NOTE_FALLBACK_CHARS).collect(),
        reason: NOTE_FALLBACK_REASON.to_string(),
        key_points: Vec::new(),
        fallback: true,
    }
}

/// Summarise a note and say why it is worth revisiting.
pub async fn summarize_note(
    pipeline: &GenerationPipeline,
    title: &str,
    content: &str,
    owner: Option<&str>,
) -> Result<NoteSummary, PipelineError> {
    let context = PromptContext::new()
        .with("title", title)
        .with("content", content);
    let req = GenerationRequest::new(TemplateId::NoteSummary, context).owner(owner);

    match pipeline.generate_with(&req, parse_note_summary).await {
        Ok(outcome) => Ok(outcome.value),
        Err(PipelineError::Unparseable(err)) => Ok(note_fallback(&err.raw)),
        Err(err) => Err(err),
    }
}
