use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::api::{HistoryRow, JobRequest};
use crate::engine::helpers::truthy;
use crate::engine::models::{RemoteSystem, SystemEvent};
use crate::engine::EngineContext;
use crate::types::EngineError;

use super::http::Transport;
use super::paged::{ColumnSpec, Dataset, PagedLoader, RowParser};
use super::retry::RetryPolicy;

/// History table columns as `(id, mandatory, visible)`.
pub const HISTORY_COLUMNS: &[(&str, bool, bool)] = &[
    ("time", true, true),
    ("name", true, true),
    ("v_r", false, true),
    ("arch", false, true),
    ("action", false, true),
    ("ver", false, false),
    ("rel", false, false),
    ("preVer", false, false),
    ("preRel", false, false),
    ("op", false, false),
    ("repoName", false, true),
    ("repoAlias", false, false),
    ("instd", false, false),
];

/// A normalized history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub hid: u64,
    pub ts: i64,
    pub time: DateTime<Utc>,
    pub op: Option<String>,
    pub action: Option<&'static str>,
    pub name: String,
    pub arch: String,
    pub ver: String,
    pub rel: String,
    pub pre_ver: Option<String>,
    pub pre_rel: Option<String>,
    pub v_r: String,
    pub repo_name: Option<String>,
    pub repo_alias: Option<String>,
    pub instd: bool,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        let current = format!("{}-{}", row.ver, row.rel);
        let previous = match (&row.pre_ver, &row.pre_rel) {
            (Some(ver), Some(rel)) if !ver.is_empty() && !rel.is_empty() => Some(format!("{ver}-{rel}")),
            _ => None,
        };
        let v_r = match (row.op.as_deref(), previous) {
            (Some("up"), Some(previous)) => format!("{previous} ⟶ {current}"),
            (Some("dn"), Some(previous)) => format!("{current} ⟵ {previous}"),
            _ => current,
        };

        Self {
            hid: row.hid,
            ts: row.ts,
            time: DateTime::from_timestamp(row.ts, 0).unwrap_or_default(),
            action: row.op.as_deref().and_then(action_label),
            op: row.op,
            name: row.name,
            arch: row.arch,
            ver: row.ver,
            rel: row.rel,
            pre_ver: row.pre_ver,
            pre_rel: row.pre_rel,
            v_r,
            repo_name: row.repo_name,
            repo_alias: row.repo_alias,
            instd: row.instd.as_ref().map(truthy).unwrap_or(false),
        }
    }
}

fn action_label(op: &str) -> Option<&'static str> {
    match op {
        "in" => Some("Install"),
        "up" => Some("Upgrade"),
        "dn" => Some("Downgrade"),
        "rm" => Some("Remove"),
        "rf" => Some("Refresh"),
        _ => None,
    }
}

/// Normalize raw history rows, returning the records and the highest id seen.
pub fn normalize_history(rows: &[Value]) -> (Vec<HistoryRecord>, Option<u64>) {
    let mut records = Vec::with_capacity(rows.len());
    let mut last = None;
    for row in rows {
        match serde_json::from_value::<HistoryRow>(row.clone()) {
            Ok(row) => {
                if row.hid > 0 && last.map_or(true, |l| l < row.hid) {
                    last = Some(row.hid);
                }
                records.push(HistoryRecord::from(row));
            }
            Err(err) => debug!(error = %err, "Skipping malformed history row"),
        }
    }
    (records, last)
}

/// Decorates raw rows in place with the derived display fields, so the
/// column sampling of a paged load sees them.
fn annotate_rows(rows: &mut Vec<Value>) {
    for row in rows.iter_mut() {
        let Ok(parsed) = serde_json::from_value::<HistoryRow>(row.clone()) else {
            continue;
        };
        let record = HistoryRecord::from(parsed);
        if let Some(obj) = row.as_object_mut() {
            obj.insert("v_r".into(), Value::String(record.v_r));
            obj.insert("time".into(), Value::String(record.time.to_rfc3339()));
            obj.insert("instd".into(), Value::Bool(record.instd));
            if let Some(action) = record.action {
                obj.insert("action".into(), Value::String(action.to_string()));
            }
        }
    }
}

#[derive(Default)]
struct FeedState {
    records: Vec<HistoryRecord>,
    columns: Vec<(String, bool)>,
    watermark: Option<u64>,
}

/// History table of one system, kept current through incremental fetches.
pub struct HistoryFeed {
    system: Arc<RemoteSystem>,
    loader: PagedLoader,
    transport: Arc<dyn Transport>,
    timeout: std::time::Duration,
    retry: RetryPolicy,
    state: Mutex<FeedState>,
}

impl HistoryFeed {
    pub fn new(system: Arc<RemoteSystem>, ctx: &EngineContext) -> Arc<Self> {
        let columns = HISTORY_COLUMNS
            .iter()
            .map(|(id, mandatory, visible)| ColumnSpec {
                id: id.to_string(),
                mandatory: *mandatory,
                visible: *visible,
            })
            .collect();
        let parser: RowParser = Arc::new(annotate_rows);
        let loader = PagedLoader::new(ctx.transport.clone(), columns, ctx.settings.request_timeout)
            .with_parser(parser);
        Arc::new(Self {
            system,
            loader,
            transport: ctx.transport.clone(),
            timeout: ctx.settings.request_timeout,
            retry: ctx.settings.history_retry,
            state: Mutex::new(FeedState::default()),
        })
    }

    pub fn system(&self) -> &Arc<RemoteSystem> {
        &self.system
    }

    pub fn watermark(&self) -> Option<u64> {
        self.state.lock().watermark
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.state.lock().records.clone()
    }

    pub fn is_column_visible(&self, column: &str) -> bool {
        self.state
            .lock()
            .columns
            .iter()
            .any(|(id, visible)| id == column && *visible)
    }

    /// Replace the table with a full load of the system's history.
    pub async fn load(&self) -> Option<usize> {
        let url = self.system.url("history", false);
        let Dataset { rows, columns } = self.loader.load(&url).await?;
        let (records, last) = normalize_history(&rows);
        let count = records.len();

        let mut state = self.state.lock();
        state.records = records;
        state.columns = columns;
        state.watermark = last;
        info!(usid = %self.system.usid(), records = count, watermark = ?last, "History loaded");
        Some(count)
    }

    /// Fetch records newer than the watermark and merge them.
    ///
    /// Returns the number of merged records; nothing is requested while the
    /// watermark is unset.
    pub async fn request_update(&self) -> Result<usize, EngineError> {
        let Some(last) = self.watermark() else {
            return Ok(0);
        };
        let url = self.system.url("history", false);
        let reply = self
            .retry
            .run("history update", |_| {
                let request = JobRequest::get(url.clone())
                    .timeout(self.timeout)
                    .param("lastid", last.to_string());
                let transport = self.transport.clone();
                async move { transport.send(request).await.into_result() }
            })
            .await?;

        let Some(rows) = reply.get("data").and_then(|d| d.as_array()).cloned() else {
            return Err(EngineError::Protocol("history update without data".to_string()));
        };
        self.system.put_new_history_data(rows.clone());

        let (records, newest) = normalize_history(&rows);
        let Some(newest) = newest else {
            return Ok(0);
        };
        let mut state = self.state.lock();
        let fresh: Vec<HistoryRecord> = records.into_iter().filter(|r| r.hid > last).collect();
        let merged = fresh.len();
        state.records.extend(fresh);
        state.watermark = Some(newest.max(last));
        debug!(usid = %self.system.usid(), merged, watermark = newest, "History updated");
        Ok(merged)
    }

    /// React to the system's events until it goes away.
    ///
    /// A new history id triggers an incremental update; recovering from
    /// `authreq`, `offline` or `error` triggers a full reload.
    pub fn attach(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.system.subscribe();
        let feed = Arc::downgrade(self);
        let live = self.system.kind().is_live();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "History listener lagged behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(feed) = feed.upgrade() else {
                    break;
                };
                match event {
                    SystemEvent::HistoryUpdated { .. } if live => {
                        if let Err(err) = feed.request_update().await {
                            warn!(error = %err, "Incremental history fetch gave up");
                        }
                    }
                    SystemEvent::StatusChanged { old, new } if new.is_recovery_from(old) => {
                        feed.load().await;
                    }
                    _ => {}
                }
            }
        })
    }
}
