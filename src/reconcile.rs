//! Promote parsed JSON records to typed task drafts and patches.
//!
//! Untyped JSON stops here: every generated item is validated field by field,
//! malformed items are reported in `skipped` and never abort the batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parser::{AlignedPatch, Record};

// =============================================================================
// Domain types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Archived => "archived",
        }
    }

    /// Lenient parse: accepts `in_progress`, `in-progress` and `inProgress`.
    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "pending" => Some(TaskStatus::Pending),
            "inprogress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "archived" => Some(TaskStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "urgent" => Some(TaskPriority::Urgent),
            "high" => Some(TaskPriority::High),
            "medium" => Some(TaskPriority::Medium),
            "low" => Some(TaskPriority::Low),
            _ => None,
        }
    }
}

fn normalize_token(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// An existing task supplied by the caller's persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default)]
    pub planned_date: Option<NaiveDate>,
    #[serde(default)]
    pub planned_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub planned_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task to be created, with defaults and timestamps applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub planned_date: Option<NaiveDate>,
    pub planned_start_time: Option<DateTime<Utc>>,
    pub planned_end_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Changed fields of an existing task. `None` means "leave as is".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskPatch {
    fn empty(id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: None,
            description: None,
            status: None,
            priority: None,
            planned_date: None,
            planned_start_time: None,
            planned_end_time: None,
            completed_at: None,
            updated_at: now,
        }
    }

    fn has_changes(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || self.status.is_some()
            || self.priority.is_some()
            || self.planned_date.is_some()
            || self.planned_start_time.is_some()
            || self.planned_end_time.is_some()
            || self.completed_at.is_some()
    }
}

/// Values applied to drafts that omit status or priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Defaults {
    pub status: TaskStatus,
    pub priority: TaskPriority,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Created,
    Updated,
}

/// A generated element that was dropped, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub side: Side,
    pub index: usize,
    pub reason: String,
}

impl SkippedItem {
    pub fn new(side: Side, index: usize, reason: impl Into<String>) -> Self {
        Self {
            side,
            index,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciledResult {
    pub created: Vec<TaskDraft>,
    pub updated: Vec<TaskPatch>,
    pub skipped: Vec<SkippedItem>,
}

// =============================================================================
// Field access
// =============================================================================

fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for c in snake.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Look up a field by its snake_case name, falling back to camelCase.
fn field<'a>(record: &'a Record, name: &str) -> Option<&'a Value> {
    record
        .get(name)
        .or_else(|| record.get(&camel_case(name)))
        .filter(|v| !v.is_null())
}

fn text_field(record: &Record, name: &str) -> Option<String> {
    match field(record, name)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn date_field(record: &Record, name: &str) -> Option<NaiveDate> {
    let raw = text_field(record, name)?;
    parse_date(&raw).or_else(|| {
        tracing::debug!(field = name, value = %raw, "ignoring unparseable date");
        None
    })
}

fn timestamp_field(record: &Record, name: &str) -> Option<DateTime<Utc>> {
    let raw = text_field(record, name)?;
    parse_timestamp(&raw).or_else(|| {
        tracing::debug!(field = name, value = %raw, "ignoring unparseable timestamp");
        None
    })
}

/// `YYYY-MM-DD`, or the date part of a timestamp.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]` read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Turn generated "created" records into drafts.
///
/// Records without a non-empty title are skipped. Missing or unrecognised
/// status and priority take `defaults`.
pub fn reconcile_created(
    records: Vec<Record>,
    defaults: Defaults,
    now: DateTime<Utc>,
) -> (Vec<TaskDraft>, Vec<SkippedItem>) {
    let mut drafts = Vec::with_capacity(records.len());
    let mut skipped = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        let Some(title) = text_field(&record, "title") else {
            tracing::warn!(index, "skipping generated task without a title");
            skipped.push(SkippedItem::new(Side::Created, index, "missing title"));
            continue;
        };

        let status = text_field(&record, "status")
            .and_then(|s| TaskStatus::parse(&s))
            .unwrap_or(defaults.status);
        let priority = text_field(&record, "priority")
            .and_then(|s| TaskPriority::parse(&s))
            .unwrap_or(defaults.priority);
        let completed_at = match status {
            TaskStatus::Completed => timestamp_field(&record, "completed_at").or(Some(now)),
            _ => None,
        };

        drafts.push(TaskDraft {
            title,
            description: text_field(&record, "description"),
            status,
            priority,
            planned_date: date_field(&record, "planned_date"),
            planned_start_time: timestamp_field(&record, "planned_start_time"),
            planned_end_time: timestamp_field(&record, "planned_end_time"),
            completed_at,
            created_at: now,
            updated_at: now,
        });
    }

    (drafts, skipped)
}

/// Turn aligned "updated" records into patches against `existing`.
///
/// The patch id always comes from the existing record. Only fields that
/// differ are carried; a patch that changes nothing is skipped.
pub fn reconcile_updated(
    patches: Vec<AlignedPatch>,
    existing: &[TaskRecord],
    now: DateTime<Utc>,
) -> (Vec<TaskPatch>, Vec<SkippedItem>) {
    let mut out = Vec::with_capacity(patches.len());
    let mut skipped = Vec::new();

    for aligned in patches {
        let Some(current) = existing.get(aligned.target) else {
            skipped.push(SkippedItem::new(
                Side::Updated,
                aligned.index,
                "no existing task at aligned position",
            ));
            continue;
        };

        let patch = build_patch(&aligned.fields, current, now);
        if patch.has_changes() {
            out.push(patch);
        } else {
            tracing::debug!(index = aligned.index, id = current.id, "patch changes nothing");
            skipped.push(SkippedItem::new(
                Side::Updated,
                aligned.index,
                "no changed fields",
            ));
        }
    }

    (out, skipped)
}

fn build_patch(fields: &Record, current: &TaskRecord, now: DateTime<Utc>) -> TaskPatch {
    let mut patch = TaskPatch::empty(current.id, now);

    patch.title = text_field(fields, "title").filter(|t| *t != current.title);
    patch.description =
        text_field(fields, "description").filter(|d| Some(d) != current.description.as_ref());
    patch.status = text_field(fields, "status")
        .and_then(|s| TaskStatus::parse(&s))
        .filter(|s| *s != current.status);
    patch.priority = text_field(fields, "priority")
        .and_then(|s| TaskPriority::parse(&s))
        .filter(|p| *p != current.priority);
    patch.planned_date =
        date_field(fields, "planned_date").filter(|d| Some(*d) != current.planned_date);
    patch.planned_start_time = timestamp_field(fields, "planned_start_time")
        .filter(|t| Some(*t) != current.planned_start_time);
    patch.planned_end_time = timestamp_field(fields, "planned_end_time")
        .filter(|t| Some(*t) != current.planned_end_time);
    patch.completed_at = timestamp_field(fields, "completed_at")
        .filter(|t| Some(*t) != current.completed_at);

    if patch.status == Some(TaskStatus::Completed) && patch.completed_at.is_none() {
        patch.completed_at = Some(now);
    }

    patch
}
