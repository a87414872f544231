use std::sync::Arc;

use serde_json::Value;

use crate::engine::api::CheckPayload;
use crate::engine::core::JobResult;

use super::SystemStatus;

/// Notifications published by a single [`super::RemoteSystem`].
#[derive(Debug, Clone)]
pub enum SystemEvent {
    StatusChanged {
        old: SystemStatus,
        new: SystemStatus,
    },
    CheckChange {
        new: Arc<CheckPayload>,
        old: Option<Arc<CheckPayload>>,
    },
    HistoryUpdated {
        old: Option<u64>,
        new: Option<u64>,
    },
    SystemsUpdated,
    NewHistoryData(Arc<Vec<Value>>),
    CompareDataLoaded(Arc<JobResult>),
    AnalyzeDataLoaded(Arc<JobResult>),
    AuthRequired,
    AuthFinished(bool),
}

/// Notifications published by a [`super::SystemTree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Changed,
    StatesRefreshed,
    StatusesUpdated,
    SelfSystemLoaded(String),
    ActiveChanged {
        old: Option<String>,
        new: String,
    },
}
