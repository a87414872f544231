//! Remote synchronization and job orchestration for the zyppmon console.
//!
//! - `core`: transport, auth tokens, bounded retries, paged loads, async jobs, history feed
//! - `models`: monitored systems, their status machine and the system tree
//! - `api`: request builder and wire payloads

mod api;
mod core;
mod helpers;
mod models;

use std::sync::Arc;
use std::time::Duration;

pub use api::{
    is_auth_error, CheckPayload, HistoryRow, JobRequest, JobStatus, JobTicket, Method, PageCtrl,
    PagedResponse, SystemRecord,
};
pub use core::{
    column_visibility, normalize_history, root_host, AnalyzeJob, AsyncJobPoller, AuthFlow,
    ColumnSpec, CompareJob, Dataset, HistoryFeed, HistoryRecord, HttpJobClient, JobKind, JobPage,
    JobResult, JobTracker, LoadEvent, Outcome, PageCursor, PagedLoader, RetryPolicy, SectionMask,
    TokenStore, Transport, COMPARE_SECTIONS, HISTORY_COLUMNS,
};
pub use helpers::{fix_url, random_token, AUTH_HEADER};
pub use models::{
    ReconcileReport, RemoteSystem, SystemEvent, SystemKind, SystemStatus, SystemTree, TreeEvent,
};

/// Timing and retry knobs shared by every component.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub request_timeout: Duration,
    pub check_interval: Duration,
    pub submit_retry: RetryPolicy,
    pub poll_retry: RetryPolicy,
    pub fetch_retry: RetryPolicy,
    pub tree_retry: RetryPolicy,
    pub history_retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        crate::config::Config::default().settings()
    }
}

/// Collaborators handed to every entity and tree.
#[derive(Clone)]
pub struct EngineContext {
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<TokenStore>,
    pub auth: Option<Arc<dyn AuthFlow>>,
    pub settings: Arc<EngineSettings>,
}

impl EngineContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            transport,
            tokens,
            auth: None,
            settings: Arc::new(settings),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthFlow>) -> Self {
        self.auth = Some(auth);
        self
    }
}
