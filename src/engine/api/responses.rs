use serde::Deserialize;
use serde_json::{Map, Value};

use crate::engine::helpers::{cursor_value, value_as_string};
use crate::engine::models::SystemKind;

/// Payload of `<base>/check` (or `/stat` for file-backed systems).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CheckPayload {
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_string")]
    pub error: Option<String>,
    #[serde(default, rename = "systems-ts")]
    pub systems_ts: Option<Value>,
    #[serde(default)]
    pub count: Option<Value>,
    #[serde(default)]
    pub installed: Option<Value>,
    #[serde(default)]
    pub removed: Option<Value>,
    #[serde(default, rename = "history-count")]
    pub history_count: Option<Value>,
    #[serde(default, rename = "history-in")]
    pub history_in: Option<Value>,
    #[serde(default, rename = "history-up")]
    pub history_up: Option<Value>,
    #[serde(default, rename = "history-dn")]
    pub history_dn: Option<Value>,
    #[serde(default, rename = "history-rm")]
    pub history_rm: Option<Value>,
    #[serde(default, rename = "history-rf")]
    pub history_rf: Option<Value>,
    #[serde(default, rename = "history-last-id", deserialize_with = "deserialize_history_id")]
    pub history_last_id: Option<u64>,
}

impl CheckPayload {
    pub fn is_auth_error(&self) -> bool {
        self.status.as_deref() == Some("error")
            && self
                .error
                .as_deref()
                .map(|e| e.starts_with("AUTH_"))
                .unwrap_or(false)
    }

    /// True when any of the tracked counters differ from `other`.
    pub fn differs_from(&self, other: &CheckPayload) -> bool {
        self.count != other.count
            || self.installed != other.installed
            || self.removed != other.removed
            || self.systems_ts != other.systems_ts
            || self.history_count != other.history_count
            || self.history_dn != other.history_dn
            || self.history_in != other.history_in
            || self.history_last_id != other.history_last_id
            || self.history_rf != other.history_rf
            || self.history_rm != other.history_rm
            || self.history_up != other.history_up
    }
}

/// One entry of the `/systems` listing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SystemRecord {
    #[serde(deserialize_with = "deserialize_usid")]
    pub usid: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SystemKind,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ufl: Option<Value>,
    #[serde(default)]
    pub file: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default, rename = "parentUSID")]
    pub parent_usid: Option<String>,
}

impl SystemRecord {
    pub fn new(usid: impl Into<String>, name: impl Into<String>, kind: SystemKind) -> Self {
        Self {
            usid: usid.into(),
            name: name.into(),
            kind,
            enabled: None,
            host: None,
            ufl: None,
            file: None,
            timestamp: None,
            parent_usid: None,
        }
    }

    /// File-backed snapshots are usable once both the upload and the file exist.
    pub fn is_materialized(&self) -> bool {
        let present = |v: &Option<Value>| v.as_ref().map(crate::engine::helpers::truthy).unwrap_or(false);
        present(&self.ufl) && present(&self.file)
    }

    /// Parse a `/systems` reply, skipping records that do not fit the schema.
    pub fn parse_list(value: &Value) -> Option<Vec<SystemRecord>> {
        let items = value.as_array()?;
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<SystemRecord>(item.clone()) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(error = %err, "Skipping malformed system record"),
            }
        }
        Some(records)
    }
}

fn deserialize_usid<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_as_string(&value).ok_or_else(|| serde::de::Error::custom("usid must be a string or number"))
}

fn deserialize_loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_as_string(&value))
}

/// Numbers and numeric strings are ids, everything else reads as unset.
fn deserialize_history_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Control block attached to every paged reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageCtrl {
    pub section: Option<String>,
    pub token: Option<String>,
    pub next: Option<String>,
    pub size: u64,
    pub start: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PagedResponse {
    pub ctrl: Option<PageCtrl>,
    pub data: Option<Vec<Value>>,
}

impl PagedResponse {
    pub fn from_value(value: &Value) -> Self {
        let ctrl = value.get("ctrl").and_then(|c| c.as_object()).map(|ctrl| PageCtrl {
            section: ctrl.get("section").and_then(value_as_string),
            token: ctrl.get("token").and_then(value_as_string),
            next: ctrl.get("next").and_then(cursor_value),
            size: ctrl.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
            start: ctrl.get("start").and_then(|v| v.as_u64()).unwrap_or(0),
        });
        let data = value.get("data").and_then(|d| d.as_array()).cloned();
        Self { ctrl, data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Ok,
    Other(String),
}

impl From<&str> for JobStatus {
    fn from(value: &str) -> Self {
        match value {
            "pending" => JobStatus::Pending,
            "ok" => JobStatus::Ok,
            other => JobStatus::Other(other.to_string()),
        }
    }
}

/// `{<id_field>, status}` reply produced by job submission and status checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub id: String,
    pub status: JobStatus,
}

impl JobTicket {
    pub fn from_value(value: &Value, id_field: &str) -> Option<Self> {
        let id = value.get(id_field).and_then(value_as_string)?;
        let status = value.get("status").and_then(|v| v.as_str())?;
        if id.is_empty() || status.is_empty() {
            return None;
        }
        Some(Self {
            id,
            status: JobStatus::from(status),
        })
    }
}

/// Raw history record as served by `<base>/history`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HistoryRow {
    pub hid: u64,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub ver: String,
    #[serde(default)]
    pub rel: String,
    #[serde(default, rename = "preVer")]
    pub pre_ver: Option<String>,
    #[serde(default, rename = "preRel")]
    pub pre_rel: Option<String>,
    #[serde(default, rename = "repoName")]
    pub repo_name: Option<String>,
    #[serde(default, rename = "repoAlias")]
    pub repo_alias: Option<String>,
    #[serde(default)]
    pub instd: Option<Value>,
}

/// `{status: "error", error: "AUTH_..."}` on any endpoint.
pub fn is_auth_error(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    auth_error_in(obj)
}

fn auth_error_in(obj: &Map<String, Value>) -> bool {
    obj.get("status").and_then(|v| v.as_str()) == Some("error")
        && obj
            .get("error")
            .and_then(|v| v.as_str())
            .map(|e| e.starts_with("AUTH_"))
            .unwrap_or(false)
}
