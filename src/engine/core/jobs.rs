use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::engine::api::{JobRequest, JobStatus, JobTicket, PagedResponse};
use crate::engine::EngineSettings;
use crate::types::EngineError;

use super::http::Transport;

pub const COMPARE_SECTIONS: &[&str] = &["info_cmp", "stat_cmp", "packages_cmp"];
const ANALYZE_SECTIONS: &[&str] = &["analize"];

/// Widest section list a [`SectionMask`] can track.
pub const MAX_SECTIONS: usize = u64::BITS as usize;

/// Continuation of one section stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub token: String,
    pub next: String,
}

/// One accepted page of a section.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPage {
    pub token: Option<String>,
    pub next: Option<String>,
    pub rows: Vec<Value>,
}

/// Endpoints and payload shapes of one server-side job type.
pub trait JobKind: Send + Sync {
    fn name(&self) -> &'static str;

    /// Field carrying the job id in submit/status replies.
    fn id_field(&self) -> &'static str;

    fn submit_request(&self) -> JobRequest;

    fn status_request(&self, job_id: &str) -> JobRequest;

    fn sections(&self) -> &'static [&'static str];

    fn page_request(&self, job_id: &str, section: &str, cursor: Option<&PageCursor>) -> JobRequest;

    /// Default shape: `{ctrl: {section, token, next?}, data: []}` for the requested section.
    fn parse_page(&self, section: &str, value: &Value) -> Option<JobPage> {
        let page = PagedResponse::from_value(value);
        let ctrl = page.ctrl?;
        let rows = page.data?;
        if ctrl.section.as_deref() != Some(section) || ctrl.token.is_none() {
            return None;
        }
        Some(JobPage {
            token: ctrl.token,
            next: ctrl.next,
            rows,
        })
    }
}

/// `/compare/<left>/<right>`: package-level diff of two systems.
#[derive(Debug, Clone)]
pub struct CompareJob {
    pub left: String,
    pub right: String,
}

impl JobKind for CompareJob {
    fn name(&self) -> &'static str {
        "compare"
    }

    fn id_field(&self) -> &'static str {
        "cmpid"
    }

    fn submit_request(&self) -> JobRequest {
        JobRequest::get(format!("/compare/{}/{}", self.left, self.right))
    }

    fn status_request(&self, job_id: &str) -> JobRequest {
        JobRequest::get(format!("/compare/get/{job_id}/check"))
    }

    fn sections(&self) -> &'static [&'static str] {
        COMPARE_SECTIONS
    }

    fn page_request(&self, job_id: &str, section: &str, cursor: Option<&PageCursor>) -> JobRequest {
        let request = JobRequest::get(format!("/compare/get/{job_id}/{section}"));
        match cursor {
            Some(cursor) => request
                .param("token", cursor.token.as_str())
                .param("next", cursor.next.as_str()),
            None => request.param("token", format!("{job_id}/{section}")),
        }
    }
}

/// `/templates/analize`: match ratios of candidate systems against a template.
#[derive(Debug, Clone)]
pub struct AnalyzeJob {
    pub system: String,
    pub template: String,
}

impl JobKind for AnalyzeJob {
    fn name(&self) -> &'static str {
        "analyze"
    }

    fn id_field(&self) -> &'static str {
        "analizeid"
    }

    fn submit_request(&self) -> JobRequest {
        JobRequest::get("/templates/analize")
            .param("system", self.system.as_str())
            .param("template", self.template.as_str())
    }

    fn status_request(&self, job_id: &str) -> JobRequest {
        JobRequest::get("/templates/checkAnalize").param("analizeid", job_id)
    }

    fn sections(&self) -> &'static [&'static str] {
        ANALYZE_SECTIONS
    }

    fn page_request(&self, job_id: &str, _section: &str, cursor: Option<&PageCursor>) -> JobRequest {
        let request = JobRequest::get("/templates/getAnalize").param("analizeid", job_id);
        match cursor {
            Some(cursor) => request
                .param("token", cursor.token.as_str())
                .param("next", cursor.next.as_str()),
            None => request,
        }
    }

    /// The result is a single `{data: []}` document; a control block is optional.
    fn parse_page(&self, _section: &str, value: &Value) -> Option<JobPage> {
        let page = PagedResponse::from_value(value);
        let rows = page.data?;
        let (token, next) = page
            .ctrl
            .map(|ctrl| (ctrl.token, ctrl.next))
            .unwrap_or((None, None));
        Some(JobPage { token, next, rows })
    }
}

/// Completion bits of the sections of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionMask(u64);

impl SectionMask {
    /// Indexes past [`MAX_SECTIONS`] are ignored.
    pub fn mark(&mut self, index: usize) {
        if let Some(bit) = u32::try_from(index).ok().and_then(|i| 1u64.checked_shl(i)) {
            self.0 |= bit;
        }
    }

    pub fn is_complete(&self, sections: usize) -> bool {
        if sections > MAX_SECTIONS {
            return false;
        }
        let full = match u32::try_from(sections).ok().and_then(|n| 1u64.checked_shl(n)) {
            Some(bit) => bit - 1,
            None => u64::MAX,
        };
        self.0 == full
    }
}

/// Observable state of the job currently tracked for one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTracker {
    pub job_id: Option<String>,
    pub submit_retries: u32,
    pub poll_retries: u32,
}

/// Tracker plus the run that owns it; writes from superseded runs are dropped.
#[derive(Debug, Default)]
struct TrackedRun {
    run: u64,
    state: JobTracker,
}

/// Assembled multi-section job result.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub sections: BTreeMap<String, Vec<Value>>,
}

impl JobResult {
    pub fn section(&self, name: &str) -> Option<&[Value]> {
        self.sections.get(name).map(|rows| rows.as_slice())
    }
}

/// Drives submit, poll-until-ready and per-section paginated fetch.
#[derive(Clone)]
pub struct AsyncJobPoller {
    transport: Arc<dyn Transport>,
    settings: Arc<EngineSettings>,
    tracker: Arc<Mutex<TrackedRun>>,
}

impl AsyncJobPoller {
    pub fn new(transport: Arc<dyn Transport>, settings: Arc<EngineSettings>) -> Self {
        Self {
            transport,
            settings,
            tracker: Arc::new(Mutex::new(TrackedRun::default())),
        }
    }

    pub fn tracker(&self) -> JobTracker {
        self.tracker.lock().state.clone()
    }

    /// Run one job to completion. `None` means the job was abandoned or
    /// rejected by the server; no error is surfaced for either.
    ///
    /// Starting a run takes over the tracker from any run still in progress
    /// on a clone of this poller.
    pub async fn run(&self, job: &dyn JobKind) -> Option<JobResult> {
        let run = {
            let mut tracked = self.tracker.lock();
            tracked.run += 1;
            tracked.state = JobTracker::default();
            tracked.run
        };

        let sections = job.sections();
        if sections.len() > MAX_SECTIONS {
            warn!(job = job.name(), sections = sections.len(), "Too many job sections");
            return None;
        }

        let job_id = match self.wait_until_ready(job, run).await {
            Ok(job_id) => job_id,
            Err(err) => {
                debug!(job = job.name(), error = %err, "Job dropped before fetch");
                self.clear(run);
                return None;
            }
        };

        let fetches = sections
            .iter()
            .map(|section| self.fetch_section(job, &job_id, section));
        let results = join_all(fetches).await;

        let mut mask = SectionMask::default();
        let mut assembled = BTreeMap::new();
        for (index, (section, rows)) in sections.iter().zip(results).enumerate() {
            if let Some(rows) = rows {
                mask.mark(index);
                assembled.insert(section.to_string(), rows);
            }
        }
        self.clear(run);

        if !mask.is_complete(sections.len()) {
            warn!(job = job.name(), job_id = %job_id, "Job fetch incomplete, result dropped");
            return None;
        }
        info!(job = job.name(), job_id = %job_id, "Job result loaded");
        Some(JobResult {
            job_id,
            sections: assembled,
        })
    }

    async fn wait_until_ready(&self, job: &dyn JobKind, run: u64) -> Result<String, EngineError> {
        let request = job.submit_request();
        let mut reply = self
            .send_with_retry(self.settings.submit_retry, "job submit", request, |retry| {
                self.record(run, |tracker| tracker.submit_retries = retry);
            })
            .await?;

        let mut polls = 0;
        loop {
            let ticket = JobTicket::from_value(&reply, job.id_field()).ok_or_else(|| {
                EngineError::Protocol(format!("{} reply without id/status", job.name()))
            })?;
            self.record(run, |tracker| tracker.job_id = Some(ticket.id.clone()));

            match ticket.status {
                JobStatus::Ok => return Ok(ticket.id),
                JobStatus::Pending => {
                    polls += 1;
                    if polls > self.settings.poll_retry.max_retries() {
                        return Err(EngineError::Abandoned {
                            operation: "job poll",
                            attempts: polls,
                        });
                    }
                    self.record(run, |tracker| tracker.poll_retries = polls);
                    sleep(self.settings.poll_retry.delay()).await;
                    let request = job.status_request(&ticket.id);
                    reply = self
                        .send_with_retry(self.settings.poll_retry, "job status", request, |_| {})
                        .await?;
                }
                JobStatus::Other(status) => {
                    return Err(EngineError::Protocol(format!(
                        "{} job {} ended with status {status}",
                        job.name(),
                        ticket.id
                    )));
                }
            }
        }
    }

    async fn fetch_section(&self, job: &dyn JobKind, job_id: &str, section: &str) -> Option<Vec<Value>> {
        let mut rows = Vec::new();
        let mut cursor: Option<PageCursor> = None;
        loop {
            let request = job.page_request(job_id, section, cursor.as_ref());
            let value = match self
                .send_with_retry(self.settings.fetch_retry, "job fetch", request, |_| {})
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    debug!(job = job.name(), section, error = %err, "Section fetch stopped");
                    return None;
                }
            };

            let Some(page) = job.parse_page(section, &value) else {
                debug!(job = job.name(), section, "Dropping malformed section page");
                return None;
            };
            rows.extend(page.rows);
            match page.next {
                Some(next) => {
                    cursor = Some(PageCursor {
                        token: page.token.unwrap_or_default(),
                        next,
                    })
                }
                None => return Some(rows),
            }
        }
    }

    async fn send_with_retry<F>(
        &self,
        policy: super::RetryPolicy,
        operation: &'static str,
        request: JobRequest,
        mut on_attempt: F,
    ) -> Result<Value, EngineError>
    where
        F: FnMut(u32) + Send,
    {
        let transport = &self.transport;
        let request = request.timeout(self.settings.request_timeout);
        policy
            .run(operation, move |retry| {
                on_attempt(retry);
                let request = request.clone();
                async move { transport.send(request).await.into_result() }
            })
            .await
    }

    fn record(&self, run: u64, update: impl FnOnce(&mut JobTracker)) {
        let mut tracked = self.tracker.lock();
        if tracked.run == run {
            update(&mut tracked.state);
        }
    }

    fn clear(&self, run: u64) {
        self.record(run, |tracker| *tracker = JobTracker::default());
    }
}
