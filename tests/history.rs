//! Incremental history synchronization driven by health checks.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::{context, settle, ScriptedTransport};
use zyppmon_engine::engine::{
    HistoryFeed, JobRequest, Outcome, RemoteSystem, SystemEvent, SystemKind, SystemRecord,
};
use zyppmon_engine::types::EngineError;

const CHECK: &str = "http://h1:8880/check";
const HISTORY: &str = "http://h1:8880/history";

fn rows(ids: std::ops::RangeInclusive<u64>) -> Vec<Value> {
    ids.map(|hid| {
        json!({"hid": hid, "ts": 1_700_000_000 + hid as i64, "op": "in", "name": format!("pkg{hid}"),
               "arch": "x86_64", "ver": "1.0", "rel": "1", "repoName": "oss", "instd": 1})
    })
    .collect()
}

fn serve_history(request: &JobRequest) -> Outcome {
    if request.param_value("lastid").is_some() {
        return Outcome::Completed(json!({"data": rows(43..=50)}));
    }
    let token = request.param_value("token").unwrap_or_default().to_string();
    Outcome::Completed(json!({"ctrl": {"token": token, "next": null, "size": 3}, "data": rows(40..=42)}))
}

fn host(transport: &Arc<ScriptedTransport>) -> (Arc<RemoteSystem>, Arc<HistoryFeed>) {
    let mut record = SystemRecord::new("2", "box", SystemKind::Host);
    record.host = Some("h1".to_string());
    let ctx = context(transport);
    let system = RemoteSystem::new(record, None, ctx.clone());
    let feed = HistoryFeed::new(system.clone(), &ctx);
    (system, feed)
}

#[tokio::test]
async fn test_cursor_move_fetches_newer_records_and_advances_watermark() {
    let transport = ScriptedTransport::new();
    transport.always_with(HISTORY, serve_history);
    transport.push_json(CHECK, json!({"status": "ok", "history-last-id": 42}));
    let (system, feed) = host(&transport);
    let mut events = system.subscribe();

    assert_eq!(feed.load().await, Some(3));
    assert_eq!(feed.watermark(), Some(42));
    let listener = feed.attach();

    system.check_now().await;
    settle().await;

    let mut cursor_moves = Vec::new();
    let mut forwarded = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SystemEvent::HistoryUpdated { old, new } => cursor_moves.push((old, new)),
            SystemEvent::NewHistoryData(rows) => forwarded += rows.len(),
            _ => {}
        }
    }
    assert_eq!(cursor_moves, vec![(None, Some(42))]);
    assert_eq!(forwarded, 8);
    assert_eq!(feed.watermark(), Some(50));
    assert_eq!(feed.records().len(), 11);

    let update = transport
        .requests_to(HISTORY)
        .into_iter()
        .find(|r| r.param_value("lastid").is_some())
        .unwrap();
    assert_eq!(update.param_value("lastid"), Some("42"));
    listener.abort();
}

#[tokio::test]
async fn test_loaded_rows_are_normalized_for_display() {
    let transport = ScriptedTransport::new();
    transport.always_with(HISTORY, serve_history);
    let (_system, feed) = host(&transport);

    feed.load().await.unwrap();

    let records = feed.records();
    assert_eq!(records[0].v_r, "1.0-1");
    assert_eq!(records[0].action, Some("Install"));
    assert!(records[0].instd);
    assert_eq!(records[0].time.timestamp(), 1_700_000_040);
    assert!(feed.is_column_visible("repoName"));
    assert!(!feed.is_column_visible("preVer"));
}

#[tokio::test(start_paused = true)]
async fn test_update_retries_failed_fetches() {
    let transport = ScriptedTransport::new();
    transport.always_with(HISTORY, serve_history);
    let (_system, feed) = host(&transport);
    feed.load().await.unwrap();

    transport.push(HISTORY, Outcome::Failed);
    transport.push(HISTORY, Outcome::TimedOut);
    transport.push_json(HISTORY, json!({"data": rows(43..=45)}));

    assert_eq!(feed.request_update().await.unwrap(), 3);
    let updates = transport
        .requests_to(HISTORY)
        .into_iter()
        .filter(|r| r.param_value("lastid") == Some("42"))
        .count();
    assert_eq!(updates, 3);
    assert_eq!(feed.watermark(), Some(45));
}

#[tokio::test(start_paused = true)]
async fn test_update_gives_up_past_the_retry_ceiling() {
    let transport = ScriptedTransport::new();
    transport.always_with(HISTORY, serve_history);
    let (_system, feed) = host(&transport);
    feed.load().await.unwrap();
    let loads = transport.count(HISTORY);

    transport.always(HISTORY, Outcome::Failed);
    let err = feed.request_update().await.unwrap_err();

    assert!(matches!(err, EngineError::Abandoned { attempts: 4, .. }));
    assert_eq!(transport.count(HISTORY) - loads, 4);
    assert_eq!(feed.watermark(), Some(42));
    assert_eq!(feed.records().len(), 3);
}

#[tokio::test]
async fn test_update_without_watermark_requests_nothing() {
    let transport = ScriptedTransport::new();
    let (_system, feed) = host(&transport);

    assert_eq!(feed.request_update().await.unwrap(), 0);
    assert_eq!(transport.count(HISTORY), 0);
}

#[tokio::test]
async fn test_recovery_from_offline_reloads_history() {
    let transport = ScriptedTransport::new();
    transport.always_with(HISTORY, serve_history);
    transport.push(CHECK, Outcome::Failed);
    transport.push_json(CHECK, json!({"status": "ok"}));
    let (system, feed) = host(&transport);
    let listener = feed.attach();

    system.check_now().await;
    settle().await;
    assert_eq!(transport.count(HISTORY), 0);

    system.check_now().await;
    settle().await;
    assert_eq!(transport.count(HISTORY), 1);
    assert_eq!(feed.watermark(), Some(42));
    listener.abort();
}
