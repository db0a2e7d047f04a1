use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use planwright::cache::MemoryResponseCache;
use planwright::decompose::{decompose_task, FALLBACK_STEPS, MAX_SUBTASKS};
use planwright::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError};
use planwright::generation::GenerationClient;
use planwright::insights::{summarize_day, summarize_note, DailyJournal, SUMMARY_UNAVAILABLE};
use planwright::parser::AlignmentError;
use planwright::pipeline::{GenerationPipeline, PipelineConfig, PipelineError};
use planwright::reconcile::{Side, TaskPriority, TaskRecord, TaskStatus};
use planwright::schedule::{plan_day, WorkingHours};
use planwright::tasks::{generate_tasks, update_task};

#[derive(Default)]
struct ScriptedGateway {
    replies: Mutex<VecDeque<Option<String>>>,
    prompts: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let prompt = req
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt);
        match self.replies.lock().unwrap().pop_front().flatten() {
            Some(text) => Ok(ChatResponse::text(text)),
            None => Err(ProviderError::unavailable("backend down")),
        }
    }
}

fn scripted(replies: &[Option<&str>]) -> (Arc<ScriptedGateway>, GenerationPipeline) {
    let gw = Arc::new(ScriptedGateway {
        replies: Mutex::new(replies.iter().map(|r| r.map(str::to_string)).collect()),
        prompts: Mutex::new(Vec::new()),
    });
    let pipeline = GenerationPipeline::new(GenerationClient::new(gw.clone()), PipelineConfig::default());
    (gw, pipeline)
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn task(id: i64, title: &str) -> TaskRecord {
    let created = Utc.with_ymd_and_hms(2024, 2, 27, 8, 0, 0).unwrap();
    TaskRecord {
        id,
        title: title.to_string(),
        description: None,
        status: TaskStatus::Pending,
        priority: TaskPriority::High,
        planned_date: NaiveDate::from_ymd_opt(2024, 3, 1),
        planned_start_time: None,
        planned_end_time: None,
        completed_at: None,
        created_at: created,
        updated_at: created,
    }
}

#[tokio::test]
async fn generate_tasks_reconciles_created_and_updated() {
    let reply = r#"Sure! Here you go:
```json
{
  "created": [
    {"title": "Buy milk", "priority": "low"},
    {"description": "forgot the title"},
    {"title": "Call mom", "status": "completed"}
  ],
  "updated": [
    {"id": 11, "status": "completed"},
    {"id": 10, "title": "Write report"}
  ]
}
```"#;
    let (gw, pipeline) = scripted(&[Some(reply)]);
    let existing = vec![task(10, "Write report"), task(11, "Pay rent")];

    let result = generate_tasks(&pipeline, "buy milk, I paid rent", &existing, None, now())
        .await
        .unwrap();

    assert_eq!(result.created.len(), 2);
    assert_eq!(result.created[0].title, "Buy milk");
    assert_eq!(result.created[0].priority, TaskPriority::Low);
    assert_eq!(result.created[0].status, TaskStatus::Pending);
    assert_eq!(result.created[0].completed_at, None);
    assert_eq!(result.created[1].status, TaskStatus::Completed);
    assert_eq!(result.created[1].completed_at, Some(now()));

    assert_eq!(result.updated.len(), 1);
    let patch = &result.updated[0];
    assert_eq!(patch.id, 11);
    assert_eq!(patch.status, Some(TaskStatus::Completed));
    assert_eq!(patch.completed_at, Some(now()));
    assert_eq!(patch.title, None);
    assert_eq!(patch.updated_at, now());

    let skipped: Vec<_> = result
        .skipped
        .iter()
        .map(|s| (s.side, s.index, s.reason.as_str()))
        .collect();
    assert_eq!(
        skipped,
        [
            (Side::Created, 1, "missing title"),
            (Side::Updated, 1, "no changed fields"),
        ]
    );

    let prompt = gw.prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("buy milk, I paid rent"));
    assert!(prompt.contains("Pay rent"));
}

#[tokio::test]
async fn generate_tasks_rejects_updates_for_unknown_ids() {
    let (_, pipeline) = scripted(&[Some(r#"{"updated": [{"id": 99, "status": "completed"}]}"#)]);
    let existing = vec![task(10, "Write report")];

    let err = generate_tasks(&pipeline, "done", &existing, None, now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Alignment(AlignmentError::UnknownId { index: 0, id: 99 })
    ));
}

#[tokio::test]
async fn update_task_returns_only_changed_fields() {
    let (_, pipeline) = scripted(&[Some(r#"{"id": 10, "title": "Write report", "priority": "medium"}"#)]);
    let original = task(10, "Write report");

    let patch = update_task(&pipeline, &original, "lower the priority", Some("user-1"), now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patch.id, 10);
    assert_eq!(patch.priority, Some(TaskPriority::Medium));
    assert_eq!(patch.title, None);
    assert_eq!(patch.status, None);
}

#[tokio::test]
async fn update_task_with_no_changes_returns_none() {
    let (_, pipeline) = scripted(&[Some(r#"{"title": "Write report"}"#)]);
    let patch = update_task(&pipeline, &task(10, "Write report"), "noop", None, now())
        .await
        .unwrap();
    assert!(patch.is_none());
}

#[tokio::test]
async fn update_task_rejects_a_different_echoed_id() {
    let (_, pipeline) = scripted(&[Some(r#"{"id": 42, "priority": "low"}"#)]);
    let err = update_task(&pipeline, &task(10, "Write report"), "lower it", None, now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Alignment(AlignmentError::UnknownId { id: 42, .. })
    ));
}

#[tokio::test]
async fn decompose_caps_subtasks_and_inherits_priority() {
    let reply = r#"[
        {"title": "One", "status": "completed"},
        {"title": "Two", "priority": "low"},
        {"title": "Three"},
        {"title": "Four"},
        {"title": "Five"},
        {"title": "Six"},
        {"title": "Seven"}
    ]"#;
    let (_, pipeline) = scripted(&[Some(reply)]);
    let parent = task(5, "Launch website");

    let result = decompose_task(&pipeline, &parent, Some("ship by Friday"), None, now())
        .await
        .unwrap();

    assert!(!result.fallback);
    assert_eq!(result.subtasks.len(), MAX_SUBTASKS);
    assert_eq!(result.subtasks[4].title, "Five");
    assert!(result
        .subtasks
        .iter()
        .all(|s| s.status == TaskStatus::Pending && s.completed_at.is_none()));
    assert_eq!(result.subtasks[0].priority, TaskPriority::High);
    assert_eq!(result.subtasks[1].priority, TaskPriority::Low);
}

#[tokio::test]
async fn decompose_falls_back_on_prose_and_transport_failure() {
    let parent = task(5, "Launch website");

    let (_, pipeline) = scripted(&[Some("First, make a plan. Then do it.")]);
    let prose = decompose_task(&pipeline, &parent, None, None, now()).await.unwrap();
    assert!(prose.fallback);
    assert_eq!(prose.subtasks.len(), FALLBACK_STEPS);
    assert_eq!(prose.subtasks[0].title, "Launch website - step 1");
    assert_eq!(prose.subtasks[2].title, "Launch website - step 3");

    let (_, pipeline) = scripted(&[None]);
    let failed = decompose_task(&pipeline, &parent, None, None, now()).await.unwrap();
    assert!(failed.fallback);
    assert_eq!(failed.subtasks, prose.subtasks);
}

#[tokio::test]
async fn unusable_decomposition_is_not_cached() {
    let gw = Arc::new(ScriptedGateway {
        replies: Mutex::new(
            [r#"[]"#, r#"[{"title": "Real step"}]"#]
                .into_iter()
                .map(|r| Some(r.to_string()))
                .collect(),
        ),
        prompts: Mutex::new(Vec::new()),
    });
    let cache = Arc::new(MemoryResponseCache::new());
    let pipeline = GenerationPipeline::new(GenerationClient::new(gw.clone()), PipelineConfig::default())
        .with_cache(cache.clone());
    let parent = task(5, "Launch website");

    let first = decompose_task(&pipeline, &parent, None, None, now()).await.unwrap();
    assert!(first.fallback);
    assert!(cache.is_empty());

    let second = decompose_task(&pipeline, &parent, None, None, now()).await.unwrap();
    assert!(!second.fallback);
    assert_eq!(second.subtasks[0].title, "Real step");
    assert_eq!(gw.prompts.lock().unwrap().len(), 2);
    assert_eq!(cache.len(), 1);

    let third = decompose_task(&pipeline, &parent, None, None, now()).await.unwrap();
    assert_eq!(third.subtasks, second.subtasks);
    assert_eq!(gw.prompts.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn plan_day_parses_plan_and_sends_working_hours() {
    let reply = r#"{
        "schedule": [{"taskId": 10, "title": "Write report", "startTime": "09:00", "endTime": "10:30", "duration": 90}],
        "breaks": [],
        "summary": "Deep work first"
    }"#;
    let (gw, pipeline) = scripted(&[Some(reply)]);
    let hours: WorkingHours = "08:00-16:00".parse().unwrap();

    let plan = plan_day(&pipeline, "plan my day", &[task(10, "Write report")], hours, None)
        .await
        .unwrap();
    assert_eq!(plan.schedule.len(), 1);
    assert_eq!(plan.schedule[0].task_id.as_deref(), Some("10"));
    assert_eq!(plan.schedule[0].duration, Some(90));
    assert_eq!(plan.summary, "Deep work first");
    assert!(plan.unscheduled.is_empty());

    assert!(gw.prompts.lock().unwrap()[0].contains("08:00-16:00"));
}

#[tokio::test]
async fn plan_day_surfaces_unparseable_output() {
    let (_, pipeline) = scripted(&[Some("You should start early and rest often.")]);
    let err = plan_day(&pipeline, "plan", &[], WorkingHours::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Unparseable(_)));
}

#[tokio::test]
async fn daily_summary_degrades_to_placeholder() {
    let journal = DailyJournal {
        date: NaiveDate::from_ymd_opt(2024, 3, 1),
        completed_tasks: vec!["Write report".into()],
        mood: Some("good".into()),
        ..DailyJournal::default()
    };

    let (_, pipeline) = scripted(&[None]);
    let summary = summarize_day(&pipeline, &journal, None).await.unwrap();
    assert!(summary.degraded);
    assert_eq!(summary.text, SUMMARY_UNAVAILABLE);

    let (gw, pipeline) = scripted(&[Some("  Solid, focused day.  ")]);
    let summary = summarize_day(&pipeline, &journal, None).await.unwrap();
    assert!(!summary.degraded);
    assert_eq!(summary.text, "Solid, focused day.");
    let prompt = gw.prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("- Write report"));
    assert!(prompt.contains("2024-03-01"));
}

#[tokio::test]
async fn note_summary_parses_or_falls_back_to_raw_text() {
    let (_, pipeline) = scripted(&[Some(
        r#"{"summary": "Rust ownership notes", "reason": "Core concept", "keyPoints": ["moves", "borrows"]}"#,
    )]);
    let note = summarize_note(&pipeline, "Ownership", "...", None).await.unwrap();
    assert!(!note.fallback);
    assert_eq!(note.summary, "Rust ownership notes");
    assert_eq!(note.key_points, vec!["moves", "borrows"]);

    let prose = "This note is about ownership. ".repeat(10);
    let (_, pipeline) = scripted(&[Some(prose.as_str())]);
    let note = summarize_note(&pipeline, "Ownership", "...", None).await.unwrap();
    assert!(note.fallback);
    assert_eq!(note.summary.chars().count(), 100);
    assert!(prose.starts_with(&note.summary));
    assert!(note.key_points.is_empty());
}
