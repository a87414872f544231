use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::engine::api::{CheckPayload, JobRequest, SystemRecord};
use crate::engine::core::{AnalyzeJob, AsyncJobPoller, CompareJob, JobKind, JobResult, JobTracker};
use crate::engine::helpers::{fix_url, value_as_string};
use crate::engine::EngineContext;
use crate::types::EngineError;

use super::{SystemEvent, SystemKind, SystemStatus, SystemTree};

const EVENT_CAPACITY: usize = 64;

struct SystemState {
    name: String,
    label: String,
    enabled: bool,
    host: Option<String>,
    status: SystemStatus,
    proxied: bool,
    record: SystemRecord,
    last_check: Option<Arc<CheckPayload>>,
    history_last_id: Option<u64>,
    systems_ts: Option<Value>,
}

struct JobSlot {
    poller: AsyncJobPoller,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight flag when the check finishes or is cancelled.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl JobSlot {
    fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// One monitored system: the running collector itself, a remote host,
/// an imported snapshot file or a comparison template.
///
/// Lifetime is owned by the [`SystemTree`] that created it; the parent link
/// is only used for addressing.
pub struct RemoteSystem {
    usid: String,
    kind: SystemKind,
    parent: Option<Weak<RemoteSystem>>,
    parent_usid: Option<String>,
    ctx: EngineContext,
    state: Mutex<SystemState>,
    events: broadcast::Sender<SystemEvent>,
    check_in_flight: AtomicBool,
    checking: AtomicBool,
    auth_in_progress: AtomicBool,
    check_task: Mutex<Option<JoinHandle<()>>>,
    compare: JobSlot,
    analyze: JobSlot,
    children: Mutex<Option<Arc<SystemTree>>>,
}

impl RemoteSystem {
    pub fn new(record: SystemRecord, parent: Option<&Arc<RemoteSystem>>, ctx: EngineContext) -> Arc<Self> {
        let status = initial_status(&record);
        let label = match parent {
            Some(parent) => format!(" - {} @{}", record.name, parent.name()),
            None => record.name.clone(),
        };
        let parent_usid = record
            .parent_usid
            .clone()
            .or_else(|| parent.map(|p| p.usid().to_string()));
        if record.kind == SystemKind::Host {
            if let Some(host) = &record.host {
                ctx.tokens.register_host(host);
            }
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let poller = || AsyncJobPoller::new(ctx.transport.clone(), ctx.settings.clone());
        let compare = JobSlot {
            poller: poller(),
            task: Mutex::new(None),
        };
        let analyze = JobSlot {
            poller: poller(),
            task: Mutex::new(None),
        };

        Arc::new(Self {
            usid: record.usid.clone(),
            kind: record.kind,
            parent: parent.map(Arc::downgrade),
            parent_usid,
            state: Mutex::new(SystemState {
                name: record.name.clone(),
                label,
                enabled: record.enabled.unwrap_or(true),
                host: record.host.clone(),
                status,
                proxied: false,
                record,
                last_check: None,
                history_last_id: None,
                systems_ts: None,
            }),
            ctx,
            events,
            check_in_flight: AtomicBool::new(false),
            checking: AtomicBool::new(false),
            auth_in_progress: AtomicBool::new(false),
            check_task: Mutex::new(None),
            compare,
            analyze,
            children: Mutex::new(None),
        })
    }

    pub fn usid(&self) -> &str {
        &self.usid
    }

    pub fn kind(&self) -> SystemKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn label(&self) -> String {
        self.state.lock().label.clone()
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.enabled = enabled;
        state.record.enabled = Some(enabled);
    }

    pub fn host(&self) -> Option<String> {
        self.state.lock().host.clone()
    }

    pub fn status(&self) -> SystemStatus {
        self.state.lock().status
    }

    pub fn proxied(&self) -> bool {
        self.state.lock().proxied
    }

    pub fn set_proxied(&self, proxied: bool) {
        self.state.lock().proxied = proxied;
    }

    pub fn parent(&self) -> Option<Arc<RemoteSystem>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent_usid(&self) -> Option<&str> {
        self.parent_usid.as_deref()
    }

    pub fn check_data(&self) -> Option<Arc<CheckPayload>> {
        self.state.lock().last_check.clone()
    }

    pub fn last_history_id(&self) -> Option<u64> {
        self.state.lock().history_last_id
    }

    /// Record snapshot carrying the current status.
    pub fn data(&self) -> (SystemRecord, SystemStatus) {
        let state = self.state.lock();
        (state.record.clone(), state.status)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.events.subscribe()
    }

    pub fn children(&self) -> Option<Arc<SystemTree>> {
        self.children.lock().clone()
    }

    pub(crate) fn set_children(&self, tree: Arc<SystemTree>) {
        let previous = self.children.lock().replace(tree);
        if let Some(previous) = previous {
            previous.destroy();
        }
    }

    pub fn compare_job(&self) -> JobTracker {
        self.compare.poller.tracker()
    }

    pub fn analyze_job(&self) -> JobTracker {
        self.analyze.poller.tracker()
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::SeqCst)
    }

    /// Resolve an endpoint of this system.
    ///
    /// File-backed (and proxied) systems are scoped by USID; hosts and
    /// children of hosts are addressed through the host's base URL. With
    /// `from_parent` (or once proxied) the USID-scoped console path is used.
    pub fn url(&self, section: &str, from_parent: bool) -> String {
        let (proxied, own_host) = {
            let state = self.state.lock();
            (state.proxied, state.host.clone())
        };
        let from_parent = from_parent || proxied;
        let section = section.trim_start_matches('/');

        let mut path = format!("/{section}");
        if self.kind == SystemKind::File || from_parent {
            path = format!("/{}{}", self.usid, path);
            if from_parent {
                return path;
            }
        }

        let parent = self.parent();
        if self.kind == SystemKind::Host || parent.is_some() {
            let host = match &parent {
                Some(parent) => parent.host(),
                None => own_host,
            };
            if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
                return format!("{}{}", fix_url(&host), path.trim_start_matches('/'));
            }
        }
        path
    }

    /// Apply a fresh server record. Returns whether anything visible changed.
    pub fn update(&self, record: &SystemRecord) -> bool {
        if record.kind != self.kind {
            warn!(usid = %self.usid, "Ignoring kind change reported for system");
        }
        let parent_name = self.parent().map(|p| p.name());
        let mut events = Vec::new();
        let changed = {
            let mut state = self.state.lock();
            let mut changed = state.record.timestamp != record.timestamp;
            if state.name != record.name {
                state.name = record.name.clone();
                state.label = match &parent_name {
                    Some(parent) => format!(" - {} @{}", record.name, parent),
                    None => record.name.clone(),
                };
                changed = true;
            }
            let enabled = record.enabled.unwrap_or(true);
            if state.enabled != enabled {
                state.enabled = enabled;
                changed = true;
            }
            if state.host != record.host && record.host.is_some() {
                state.host = record.host.clone();
                changed = true;
            }
            if self.kind.is_snapshot() {
                let status = initial_status(record);
                if let Some(event) = transition(&mut state, status) {
                    events.push(event);
                    changed = true;
                }
            }
            let mut next = record.clone();
            next.usid = self.usid.clone();
            next.kind = self.kind;
            state.record = next;
            changed
        };
        self.emit_all(events);
        changed
    }

    /// Start (or resume) the check loop.
    ///
    /// Live systems poll `check` at the configured interval, file snapshots
    /// fetch `stat` once per call, templates are never checked.
    pub fn start_checking(self: &Arc<Self>) {
        match self.kind {
            SystemKind::Template => {}
            SystemKind::File => {
                let system = Arc::clone(self);
                tokio::spawn(async move { system.check_now().await });
            }
            SystemKind::SelfSystem | SystemKind::Host => {
                self.checking.store(true, Ordering::SeqCst);
                let mut task = self.check_task.lock();
                if task.is_some() {
                    return;
                }
                let weak = Arc::downgrade(self);
                let interval = self.ctx.settings.check_interval;
                *task = Some(tokio::spawn(async move {
                    loop {
                        let Some(system) = weak.upgrade() else {
                            break;
                        };
                        if system.is_checking() {
                            system.check_now().await;
                        }
                        drop(system);
                        sleep(interval).await;
                    }
                }));
            }
        }
    }

    /// Pause the check loop. The self system keeps polling unless `force` is set.
    pub fn stop_checking(&self, force: bool) {
        if self.kind == SystemKind::SelfSystem && !force {
            return;
        }
        self.checking.store(false, Ordering::SeqCst);
    }

    /// Run a single health check unless one is already outstanding.
    pub async fn check_now(self: &Arc<Self>) {
        let Some(_in_flight) = InFlight::acquire(&self.check_in_flight) else {
            debug!(usid = %self.usid, "Check already in flight");
            return;
        };
        let section = if self.kind == SystemKind::File { "stat" } else { "check" };
        let request = JobRequest::get(self.url(section, false)).timeout(self.ctx.settings.request_timeout);

        match self.ctx.transport.send(request).await.into_result() {
            Ok(value) => self.on_check_completed(value),
            Err(err) => {
                debug!(usid = %self.usid, error = %err, "Check failed");
                self.set_status(SystemStatus::Offline);
            }
        }
    }

    fn on_check_completed(self: &Arc<Self>, value: Value) {
        let payload: CheckPayload = match serde_json::from_value(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(usid = %self.usid, error = %err, "Dropping malformed check payload");
                return;
            }
        };

        if payload.is_auth_error() {
            self.set_status(SystemStatus::AuthReq);
            self.request_auth();
            return;
        }

        let reachable = if self.kind == SystemKind::File {
            SystemStatus::Ok
        } else {
            SystemStatus::Online
        };

        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(ts) = &payload.systems_ts {
                if state.systems_ts.as_ref() != Some(ts) {
                    if state.systems_ts.is_some() {
                        events.push(SystemEvent::SystemsUpdated);
                    }
                    state.systems_ts = Some(ts.clone());
                }
            }

            if let Some(event) = transition(&mut state, reachable) {
                events.push(event);
            }

            let changed = match &state.last_check {
                Some(previous) => payload.differs_from(previous),
                None => true,
            };

            if self.kind.is_live() && payload.history_last_id != state.history_last_id {
                events.push(SystemEvent::HistoryUpdated {
                    old: state.history_last_id,
                    new: payload.history_last_id,
                });
                state.history_last_id = payload.history_last_id;
            }

            let payload = Arc::new(payload);
            let old = state.last_check.replace(payload.clone());
            if changed {
                events.push(SystemEvent::CheckChange { new: payload, old });
            }
        }
        self.emit_all(events);
    }

    /// Start the external login flow unless one is already running for this system.
    pub fn request_auth(self: &Arc<Self>) -> Option<JoinHandle<bool>> {
        let flow = self.ctx.auth.clone()?;
        if self.auth_in_progress.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.emit(SystemEvent::AuthRequired);
        let system = Arc::clone(self);
        Some(tokio::spawn(async move {
            let succeeded = flow.authenticate(system.clone()).await;
            system.auth_in_progress.store(false, Ordering::SeqCst);
            system.emit(SystemEvent::AuthFinished(succeeded));
            succeeded
        }))
    }

    /// Authenticate and wait for the outcome, joining a flow already in progress.
    pub async fn authenticate(self: &Arc<Self>) -> bool {
        let mut events = self.subscribe();
        if let Some(task) = self.request_auth() {
            return task.await.unwrap_or(false);
        }
        if !self.auth_in_progress.load(Ordering::SeqCst) {
            return false;
        }
        loop {
            match events.recv().await {
                Ok(SystemEvent::AuthFinished(succeeded)) => return succeeded,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }

    pub fn set_active(self: &Arc<Self>) {
        if self.status() == SystemStatus::AuthReq {
            self.request_auth();
        }
    }

    pub async fn rename(&self, name: &str) -> Result<(), EngineError> {
        let request = JobRequest::get(format!("/system/rename/{}", self.usid))
            .timeout(self.ctx.settings.request_timeout)
            .param("usn", name);
        let reply = self.ctx.transport.send(request).await.into_result()?;
        let new_name = reply
            .get("type")
            .and(reply.get("name"))
            .and_then(value_as_string)
            .ok_or_else(|| EngineError::Protocol("rename reply without type/name".to_string()))?;

        let mut state = self.state.lock();
        state.name = new_name.clone();
        state.record.name = new_name;
        info!(usid = %self.usid, name = %state.name, "System renamed");
        Ok(())
    }

    pub async fn create_snapshot(&self) -> Result<Value, EngineError> {
        let request = JobRequest::get(format!("/system/snapshot/{}", self.usid))
            .timeout(self.ctx.settings.request_timeout);
        self.ctx.transport.send(request).await.into_result()
    }

    /// Forward incrementally fetched history rows to listeners.
    pub fn put_new_history_data(&self, rows: Vec<Value>) {
        self.emit(SystemEvent::NewHistoryData(Arc::new(rows)));
    }

    /// Compare this system with `other`; publishes `CompareDataLoaded`.
    pub fn compare(self: &Arc<Self>, other: &RemoteSystem) {
        let job = CompareJob {
            left: self.usid.clone(),
            right: other.usid().to_string(),
        };
        self.spawn_job(&self.compare, job, SystemEvent::CompareDataLoaded);
    }

    /// Analyze `system` against this template; publishes `AnalyzeDataLoaded`.
    /// Returns false when this system is not a template.
    pub fn analyze(self: &Arc<Self>, system: &RemoteSystem) -> bool {
        if self.kind != SystemKind::Template {
            return false;
        }
        let job = AnalyzeJob {
            system: system.usid().to_string(),
            template: self.usid.clone(),
        };
        self.spawn_job(&self.analyze, job, SystemEvent::AnalyzeDataLoaded);
        true
    }

    fn spawn_job<K>(self: &Arc<Self>, slot: &JobSlot, job: K, wrap: fn(Arc<JobResult>) -> SystemEvent)
    where
        K: JobKind + 'static,
    {
        let mut current = slot.task.lock();
        if let Some(previous) = current.take() {
            previous.abort();
        }
        let weak = Arc::downgrade(self);
        let poller = slot.poller.clone();
        *current = Some(tokio::spawn(async move {
            let Some(result) = poller.run(&job).await else {
                return;
            };
            if let Some(system) = weak.upgrade() {
                system.emit(wrap(Arc::new(result)));
            }
        }));
    }

    /// Mark removed and release every loop, job and child tree.
    pub fn destroy(&self) {
        self.set_status(SystemStatus::Removed);
        self.checking.store(false, Ordering::SeqCst);
        if let Some(task) = self.check_task.lock().take() {
            task.abort();
        }
        self.compare.abort();
        self.analyze.abort();
        let children = self.children.lock().take();
        if let Some(children) = children {
            children.destroy();
        }
    }

    fn set_status(&self, status: SystemStatus) {
        let event = transition(&mut self.state.lock(), status);
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn emit(&self, event: SystemEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<SystemEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

fn initial_status(record: &SystemRecord) -> SystemStatus {
    match record.kind {
        SystemKind::File | SystemKind::Template => {
            if record.is_materialized() {
                SystemStatus::Ok
            } else {
                SystemStatus::Pending
            }
        }
        SystemKind::SelfSystem | SystemKind::Host => SystemStatus::Checking,
    }
}

fn transition(state: &mut SystemState, status: SystemStatus) -> Option<SystemEvent> {
    if state.status == status {
        return None;
    }
    let old = std::mem::replace(&mut state.status, status);
    Some(SystemEvent::StatusChanged { old, new: status })
}

impl std::fmt::Debug for RemoteSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSystem")
            .field("usid", &self.usid)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}
