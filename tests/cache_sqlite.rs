use chrono::{DateTime, Duration, TimeZone, Utc};
use planwright::cache::{CacheRecord, ResponseCache, ResponseCacheKey, SqliteResponseCache};
use tempfile::tempdir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn record(key: &ResponseCacheKey, response: &str, at: DateTime<Utc>) -> CacheRecord {
    CacheRecord::new(key, "prompt text", response, None, Some("user-1")).created_at(at)
}

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    request_hash: String,
    model: String,
    response_text: String,
    reasoning_trace: Option<String>,
    owner: Option<String>,
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteResponseCache::new(&db_path).unwrap();

    let key = ResponseCacheKey::new("prompt text", "gpt-4o-mini");
    let rec = CacheRecord::new(
        &key,
        "prompt text",
        "[{\"title\": \"a\"}]",
        Some("thought about it".into()),
        Some("user-1"),
    );
    cache.put(&rec).await.unwrap();

    let hit = cache.get(&key.request_hash, 60).await.unwrap().unwrap();
    assert_eq!(hit.response_text, "[{\"title\": \"a\"}]");
    assert_eq!(hit.reasoning_trace.as_deref(), Some("thought about it"));
    assert_eq!(hit.owner.as_deref(), Some("user-1"));
    assert_eq!(hit.model, "gpt-4o-mini");
    assert_eq!(hit.created_at.timestamp_millis(), rec.created_at.timestamp_millis());

    let export_path = dir.path().join("export.jsonl");
    let written = cache.export_jsonl(&export_path).await.unwrap();
    assert_eq!(written, 1);

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].request_hash, key.request_hash);
    assert_eq!(rows[0].model, "gpt-4o-mini");
    assert_eq!(rows[0].response_text, "[{\"title\": \"a\"}]");
    assert_eq!(rows[0].reasoning_trace.as_deref(), Some("thought about it"));
    assert_eq!(rows[0].owner.as_deref(), Some("user-1"));
}

#[tokio::test]
async fn ttl_boundary_is_inclusive() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = ResponseCacheKey::new("prompt text", "gpt-4o-mini");
    cache.put(&record(&key, "fresh", t0())).await.unwrap();

    let at_edge = t0() + Duration::minutes(60);
    assert!(cache
        .get_at(&key.request_hash, 60, at_edge)
        .await
        .unwrap()
        .is_some());

    let past_edge = at_edge + Duration::milliseconds(1);
    assert!(cache
        .get_at(&key.request_hash, 60, past_edge)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn non_positive_ttl_never_hits() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = ResponseCacheKey::new("prompt text", "gpt-4o-mini");
    cache.put(&record(&key, "x", t0())).await.unwrap();

    assert!(cache.get_at(&key.request_hash, 0, t0()).await.unwrap().is_none());
    assert!(cache.get_at(&key.request_hash, -5, t0()).await.unwrap().is_none());
}

#[tokio::test]
async fn newest_row_wins_and_ties_go_to_latest_insert() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = ResponseCacheKey::new("prompt text", "gpt-4o-mini");

    cache.put(&record(&key, "newer", t0() + Duration::minutes(5))).await.unwrap();
    cache.put(&record(&key, "older", t0())).await.unwrap();

    let now = t0() + Duration::minutes(10);
    let hit = cache.get_at(&key.request_hash, 60, now).await.unwrap().unwrap();
    assert_eq!(hit.response_text, "newer");

    let tie = t0() + Duration::minutes(5);
    cache.put(&record(&key, "same instant", tie)).await.unwrap();
    let hit = cache.get_at(&key.request_hash, 60, now).await.unwrap().unwrap();
    assert_eq!(hit.response_text, "same instant");

    assert_eq!(cache.count_for(&key.request_hash).await.unwrap(), 3);
}

#[tokio::test]
async fn other_hashes_are_not_returned() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = ResponseCacheKey::new("prompt text", "gpt-4o-mini");
    let other = ResponseCacheKey::new("prompt text", "deepseek-chat");
    cache.put(&record(&key, "x", t0())).await.unwrap();

    assert!(cache
        .get_at(&other.request_hash, 60, t0())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn rows_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.sqlite");
    let key = ResponseCacheKey::new("prompt text", "gpt-4o-mini");
    {
        let cache = SqliteResponseCache::new(&path).unwrap();
        cache.put(&record(&key, "persisted", t0())).await.unwrap();
    }
    let reopened = SqliteResponseCache::new(&path).unwrap();
    let hit = reopened
        .get_at(&key.request_hash, 60, t0())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.response_text, "persisted");
}

#[tokio::test]
async fn prune_by_age_and_row_cap() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = ResponseCacheKey::new("prompt text", "gpt-4o-mini");

    for minutes in [0, 10, 20, 30] {
        cache
            .put(&record(&key, &format!("m{minutes}"), t0() + Duration::minutes(minutes)))
            .await
            .unwrap();
    }

    let now = t0() + Duration::minutes(35);
    let stats = cache.prune_at(Some(20), None, now).await.unwrap();
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.remaining, 2);

    let stats = cache.prune_at(None, Some(1), now).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.remaining, 1);

    let hit = cache.get_at(&key.request_hash, 60, now).await.unwrap().unwrap();
    assert_eq!(hit.response_text, "m30");
}

#[test]
fn exclusive_lock_can_be_reacquired_after_drop() {
    let dir = tempdir().unwrap();
    let cache = SqliteResponseCache::new(dir.path().join("cache.sqlite")).unwrap();
    {
        let _lock = cache.lock_exclusive().unwrap();
    }
    let _again = cache.lock_exclusive().unwrap();
    assert!(dir.path().join("cache.lock").exists());
}
