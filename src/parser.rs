//! Structured-output extraction from free-form model text.
//!
//! Models wrap JSON in prose, code fences or both. `parse` tries, in order:
//! the whole string, the first fenced block, then balanced `{...}` / `[...]`
//! spans. Bare scalars are not structured output and fall through.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::reconcile::{Side, SkippedItem, TaskRecord};

/// A JSON object produced by the model.
pub type Record = Map<String, Value>;

/// Upper bound on opening brackets the span scan starts from.
const MAX_SPAN_CANDIDATES: usize = 64;

/// Total bytes the span scan may walk across all candidates.
const MAX_SPAN_SCAN_BYTES: usize = 2 * 1_024 * 1_024;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("Invalid fenced block regex"));

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResult {
    Single(Record),
    List(Vec<Record>),
    CreateUpdate {
        created: Vec<Record>,
        updated: Vec<Record>,
    },
}

impl ParsedResult {
    /// Flatten into a list of records.
    ///
    /// A single object becomes a one-element list, unless it is a
    /// `{"subtasks": [...]}` wrapper, which unwraps to its items.
    pub fn into_records(self) -> Vec<Record> {
        match self {
            ParsedResult::List(items) => items,
            ParsedResult::CreateUpdate { created, .. } => created,
            ParsedResult::Single(mut obj) => match obj.remove("subtasks") {
                Some(Value::Array(items)) => objects_only(items),
                Some(other) => {
                    obj.insert("subtasks".to_string(), other);
                    vec![obj]
                }
                None => vec![obj],
            },
        }
    }

    /// The single object, if this is one.
    pub fn into_single(self) -> Option<Record> {
        match self {
            ParsedResult::Single(obj) => Some(obj),
            _ => None,
        }
    }
}

fn objects_only(items: Vec<Value>) -> Vec<Record> {
    items
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// Which extraction step produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Whole,
    FencedBlock,
    BalancedSpan,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("no structured output found in model response ({} chars)", .raw.chars().count())]
pub struct UnparseableOutputError {
    pub raw: String,
}

impl UnparseableOutputError {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// First `max_chars` characters of the raw response.
    pub fn preview(&self, max_chars: usize) -> String {
        self.raw.chars().take(max_chars).collect()
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Parse raw model output into a structured result.
pub fn parse(raw: &str) -> Result<ParsedResult, UnparseableOutputError> {
    let (value, _) = extract_value(raw)?;
    Ok(classify(value))
}

/// Extract the first structured JSON value and report how it was found.
pub fn extract_value(raw: &str) -> Result<(Value, ParseStrategy), UnparseableOutputError> {
    let trimmed = raw.trim();

    if let Some(value) = structured(trimmed) {
        return Ok((value, ParseStrategy::Whole));
    }

    if let Some(block) = FENCED_BLOCK.captures(trimmed).and_then(|c| c.get(1)) {
        if let Some(value) = structured(block.as_str().trim()) {
            tracing::debug!("structured output recovered from fenced block");
            return Ok((value, ParseStrategy::FencedBlock));
        }
    }

    for span in balanced_spans(trimmed) {
        if let Some(value) = structured(span) {
            tracing::debug!("structured output recovered from embedded span");
            return Ok((value, ParseStrategy::BalancedSpan));
        }
    }

    Err(UnparseableOutputError::new(raw))
}

fn structured(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

fn classify(value: Value) -> ParsedResult {
    match value {
        Value::Array(items) => ParsedResult::List(objects_only(items)),
        Value::Object(mut obj) => {
            let is_envelope = matches!(obj.get("created"), Some(Value::Array(_)))
                && matches!(obj.get("updated"), Some(Value::Array(_)));
            if is_envelope {
                let created = take_array(&mut obj, "created");
                let updated = take_array(&mut obj, "updated");
                ParsedResult::CreateUpdate {
                    created: objects_only(created),
                    updated: objects_only(updated),
                }
            } else {
                ParsedResult::Single(obj)
            }
        }
        // `structured` only lets arrays and objects through.
        other => ParsedResult::List(objects_only(vec![other])),
    }
}

fn take_array(obj: &mut Record, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Balanced `{...}` or `[...]` spans, in order of their opening bracket.
///
/// At most [`MAX_SPAN_CANDIDATES`] openings are tried and the scans share a
/// budget of [`MAX_SPAN_SCAN_BYTES`], so unclosed brackets cannot make the
/// search quadratic in the input length.
fn balanced_spans(s: &str) -> impl Iterator<Item = &str> + '_ {
    let mut budget = MAX_SPAN_SCAN_BYTES;
    s.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .take(MAX_SPAN_CANDIDATES)
        .map_while(move |(start, _)| {
            if budget == 0 {
                return None;
            }
            let rest = &s[start..];
            let window = rest.len().min(budget);
            let end = find_matching_close(rest, window);
            budget = budget.saturating_sub(end.unwrap_or(window));
            Some(end.map(|end| &rest[..end]))
        })
        .flatten()
}

/// Byte offset just past the bracket closing the one `s` starts with,
/// looking no further than `limit` bytes.
///
/// Brackets inside JSON strings are ignored; a mismatched closer ends the
/// search.
fn find_matching_close(s: &str, limit: usize) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if i >= limit {
            return None;
        }
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Create/update proposals
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlignmentError {
    #[error("update #{index} has no existing task at that position ({existing} supplied)")]
    IndexOutOfRange { index: usize, existing: usize },
    #[error("update #{index} refers to unknown task id {id}")]
    UnknownId { index: usize, id: i64 },
    #[error("update #{index} targets task id {id}, which another update already changes")]
    DuplicateTarget { index: usize, id: i64 },
}

/// An update record paired with the existing task it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPatch {
    /// Position in the generated `updated` list.
    pub index: usize,
    /// Position in the caller's `existing` slice.
    pub target: usize,
    pub fields: Record,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateUpdateProposal {
    pub created: Vec<Record>,
    pub updated: Vec<AlignedPatch>,
    pub skipped: Vec<SkippedItem>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProposalError {
    #[error(transparent)]
    Unparseable(#[from] UnparseableOutputError),
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
}

/// Parse a create/update proposal and align its updates to `existing`.
///
/// Accepts the `{"created": [...], "updated": [...]}` envelope with either key
/// missing, a bare array (all created) or a single object (one created).
/// Updates align by echoed `id` when present, otherwise by position.
pub fn parse_create_update(
    raw: &str,
    existing: &[TaskRecord],
) -> Result<CreateUpdateProposal, ProposalError> {
    let (value, _) = extract_value(raw)?;

    let (created, updated) = match value {
        Value::Array(items) => (items, Vec::new()),
        Value::Object(mut obj) if obj.contains_key("created") || obj.contains_key("updated") => {
            (take_array(&mut obj, "created"), take_array(&mut obj, "updated"))
        }
        single @ Value::Object(_) => (vec![single], Vec::new()),
        _ => return Err(UnparseableOutputError::new(raw).into()),
    };

    let mut proposal = CreateUpdateProposal::default();

    for (index, item) in created.into_iter().enumerate() {
        match item {
            Value::Object(map) => proposal.created.push(map),
            _ => {
                tracing::warn!(index, "skipping non-object created item");
                proposal
                    .skipped
                    .push(SkippedItem::new(Side::Created, index, "not an object"));
            }
        }
    }

    let mut claimed = vec![false; existing.len()];
    for (index, item) in updated.into_iter().enumerate() {
        let Value::Object(fields) = item else {
            tracing::warn!(index, "skipping non-object updated item");
            proposal
                .skipped
                .push(SkippedItem::new(Side::Updated, index, "not an object"));
            continue;
        };

        let target = match echoed_id(&fields) {
            Some(id) => existing
                .iter()
                .position(|t| t.id == id)
                .ok_or(AlignmentError::UnknownId { index, id })?,
            None if index < existing.len() => index,
            None => {
                return Err(AlignmentError::IndexOutOfRange {
                    index,
                    existing: existing.len(),
                }
                .into())
            }
        };

        if claimed[target] {
            return Err(AlignmentError::DuplicateTarget {
                index,
                id: existing[target].id,
            }
            .into());
        }
        claimed[target] = true;

        proposal.updated.push(AlignedPatch {
            index,
            target,
            fields,
        });
    }

    Ok(proposal)
}

/// The `id` a model echoed back, as a number or numeric string.
pub(crate) fn echoed_id(fields: &Record) -> Option<i64> {
    match fields.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{TaskPriority, TaskStatus};
    use chrono::Utc;
    use serde_json::json;

    fn task(id: i64) -> TaskRecord {
        TaskRecord {
            id,
            title: format!("task {id}"),
            description: None,
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            planned_date: None,
            planned_start_time: None,
            planned_end_time: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn whole_string_json() {
        let parsed = parse(r#"  {"title": "Write report"}  "#).unwrap();
        let obj = parsed.into_single().unwrap();
        assert_eq!(obj["title"], json!("Write report"));
    }

    #[test]
    fn fenced_block_with_prose() {
        let raw = "Here you go:\n```json\n[{\"title\": \"a\"}, {\"title\": \"b\"}]\n```\nEnjoy!";
        assert_eq!(extract_value(raw).unwrap().1, ParseStrategy::FencedBlock);
        let records = parse(raw).unwrap().into_records();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn embedded_span_with_braces_in_strings() {
        let raw = r#"Result: {"desc": "a {b} c", "x": 2} done"#;
        let (value, strategy) = extract_value(raw).unwrap();
        assert_eq!(strategy, ParseStrategy::BalancedSpan);
        assert_eq!(value, json!({"desc": "a {b} c", "x": 2}));
    }

    #[test]
    fn later_candidate_tried_when_first_span_is_not_json() {
        let raw = r#"Note {this is prose} then {"ok": true}"#;
        assert_eq!(parse(raw).unwrap().into_single().unwrap()["ok"], json!(true));
    }

    #[test]
    fn escaped_quotes_stay_inside_string() {
        let raw = r#"x {"title": "Fix \"broken\" } thing"} y"#;
        let obj = parse(raw).unwrap().into_single().unwrap();
        assert_eq!(obj["title"], json!("Fix \"broken\" } thing"));
    }

    #[test]
    fn scalars_and_prose_are_unparseable() {
        let err = parse("42").unwrap_err();
        assert_eq!(err.raw, "42");
        assert!(parse("I could not decide on a plan today.").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn unclosed_brackets_fail_fast() {
        let started = std::time::Instant::now();
        let raw = "[".repeat(100_000);
        assert!(parse(&raw).is_err());
        let noisy = format!("{}{}", "{ [".repeat(40_000), r#"{"late": 1}"#);
        assert!(parse(&noisy).is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn span_budget_still_finds_json_after_prose() {
        let raw = format!("{} {{\"title\": \"a\"}}", "word ".repeat(50_000));
        let (_, strategy) = extract_value(&raw).unwrap();
        assert_eq!(strategy, ParseStrategy::BalancedSpan);
    }

    #[test]
    fn envelope_needs_both_arrays_to_classify() {
        let both = parse(r#"{"created": [{"title": "a"}], "updated": []}"#).unwrap();
        assert!(matches!(both, ParsedResult::CreateUpdate { .. }));
        let one = parse(r#"{"created": [{"title": "a"}]}"#).unwrap();
        assert!(matches!(one, ParsedResult::Single(_)));
    }

    #[test]
    fn subtasks_wrapper_unwraps() {
        let records = parse(r#"{"subtasks": [{"title": "a"}, 3, {"title": "b"}]}"#)
            .unwrap()
            .into_records();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn create_update_aligns_by_position() {
        let existing = vec![task(10), task(20)];
        let raw = r#"{"updated": [{"status": "completed"}, {"priority": "high"}]}"#;
        let proposal = parse_create_update(raw, &existing).unwrap();
        assert!(proposal.created.is_empty());
        assert_eq!(proposal.updated[0].target, 0);
        assert_eq!(proposal.updated[1].target, 1);
    }

    #[test]
    fn create_update_prefers_echoed_id() {
        let existing = vec![task(10), task(20)];
        let raw = r#"{"created": [], "updated": [{"id": "20", "status": "completed"}]}"#;
        let proposal = parse_create_update(raw, &existing).unwrap();
        assert_eq!(proposal.updated[0].target, 1);
    }

    #[test]
    fn create_update_rejects_misalignment() {
        let existing = vec![task(10)];
        let out_of_range = r#"{"updated": [{"status": "completed"}, {"status": "pending"}]}"#;
        assert!(matches!(
            parse_create_update(out_of_range, &existing),
            Err(ProposalError::Alignment(AlignmentError::IndexOutOfRange { index: 1, existing: 1 }))
        ));

        let unknown = r#"{"updated": [{"id": 99, "status": "completed"}]}"#;
        assert!(matches!(
            parse_create_update(unknown, &existing),
            Err(ProposalError::Alignment(AlignmentError::UnknownId { id: 99, .. }))
        ));

        let two = vec![task(10), task(20)];
        let twice = r#"{"updated": [{"title": "x"}, {"id": 10, "title": "y"}]}"#;
        assert!(matches!(
            parse_create_update(twice, &two),
            Err(ProposalError::Alignment(AlignmentError::DuplicateTarget { id: 10, .. }))
        ));
    }

    #[test]
    fn bare_array_and_single_object_are_created() {
        let arr = parse_create_update(r#"[{"title": "a"}, "junk", {"title": "b"}]"#, &[]).unwrap();
        assert_eq!(arr.created.len(), 2);
        assert_eq!(arr.skipped, vec![SkippedItem::new(Side::Created, 1, "not an object")]);

        let single = parse_create_update(r#"{"title": "only"}"#, &[]).unwrap();
        assert_eq!(single.created.len(), 1);
        assert!(single.updated.is_empty());
    }
}
