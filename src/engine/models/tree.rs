use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::api::{is_auth_error, JobRequest, SystemRecord};
use crate::engine::helpers::value_as_string;
use crate::engine::EngineContext;
use crate::types::EngineError;

use super::{RemoteSystem, SystemEvent, SystemKind, TreeEvent};

const EVENT_CAPACITY: usize = 64;
const ROOT_URL: &str = "/systems";

/// What a single reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addressing {
    Direct,
    Proxied,
}

#[derive(Default)]
struct TreeState {
    systems: Vec<Arc<RemoteSystem>>,
    active: Option<Arc<RemoteSystem>>,
    self_usid: Option<String>,
    /// Members inserted by this tree's own reconciliation, as opposed to spliced ones.
    owned: HashSet<String>,
    watchers: HashMap<String, Vec<JoinHandle<()>>>,
}

/// Ordered registry of monitored systems.
///
/// The root tree mirrors `/systems` of the console server. Every enabled
/// host gets a scoped child tree whose members are spliced into the root
/// right after their parent.
pub struct SystemTree {
    parent: Option<Weak<RemoteSystem>>,
    parent_usid: Option<String>,
    root: Option<Weak<SystemTree>>,
    ctx: EngineContext,
    disabled: Mutex<HashSet<String>>,
    addressing: Mutex<Addressing>,
    state: Mutex<TreeState>,
    events: broadcast::Sender<TreeEvent>,
    checking: AtomicBool,
}

impl SystemTree {
    pub fn root(ctx: EngineContext, disabled: impl IntoIterator<Item = String>) -> Arc<Self> {
        Arc::new(Self::build(ctx, None, None, disabled.into_iter().collect()))
    }

    fn scoped(parent: &Arc<RemoteSystem>, root: &Arc<SystemTree>) -> Arc<Self> {
        let disabled = root.disabled.lock().clone();
        Arc::new(Self::build(
            root.ctx.clone(),
            Some(parent),
            Some(Arc::downgrade(root)),
            disabled,
        ))
    }

    fn build(
        ctx: EngineContext,
        parent: Option<&Arc<RemoteSystem>>,
        root: Option<Weak<SystemTree>>,
        disabled: HashSet<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            parent: parent.map(Arc::downgrade),
            parent_usid: parent.map(|p| p.usid().to_string()),
            root,
            ctx,
            disabled: Mutex::new(disabled),
            addressing: Mutex::new(Addressing::Direct),
            state: Mutex::new(TreeState::default()),
            events,
            checking: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    pub fn parent(&self) -> Option<Arc<RemoteSystem>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn systems(&self) -> Vec<Arc<RemoteSystem>> {
        self.state.lock().systems.clone()
    }

    pub fn usids(&self) -> Vec<String> {
        self.state.lock().systems.iter().map(|s| s.usid().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().systems.is_empty()
    }

    pub fn get_by_usid(&self, usid: &str) -> Option<Arc<RemoteSystem>> {
        self.state.lock().systems.iter().find(|s| s.usid() == usid).cloned()
    }

    pub fn self_system(&self) -> Option<Arc<RemoteSystem>> {
        self.state
            .lock()
            .systems
            .iter()
            .find(|s| s.kind() == SystemKind::SelfSystem)
            .cloned()
    }

    pub fn disabled_systems(&self) -> Vec<String> {
        let mut disabled: Vec<String> = self.disabled.lock().iter().cloned().collect();
        disabled.sort();
        disabled
    }

    /// Where the member list of this tree is fetched from.
    pub fn list_url(&self) -> String {
        match self.parent() {
            Some(parent) => {
                let proxied = *self.addressing.lock() == Addressing::Proxied;
                parent.url("systems", proxied)
            }
            None => ROOT_URL.to_string(),
        }
    }

    /// Fetch the member list and reconcile against it.
    ///
    /// Child trees of a host fall back to the proxied path on an auth error,
    /// then ask the host to authenticate once before giving up.
    pub async fn refresh(self: &Arc<Self>) -> Result<ReconcileReport, EngineError> {
        let mut auth_attempted = false;
        loop {
            let url = self.list_url();
            let transport = self.ctx.transport.clone();
            let timeout = self.ctx.settings.request_timeout;
            let reply = self
                .ctx
                .settings
                .tree_retry
                .run("system list", |_| {
                    let request = JobRequest::get(url.clone()).timeout(timeout);
                    let transport = transport.clone();
                    async move { transport.send(request).await.into_result() }
                })
                .await?;

            let host_parent = self.parent().filter(|p| p.kind() == SystemKind::Host);
            if is_auth_error(&reply) {
                let Some(parent) = host_parent else {
                    return Err(EngineError::AuthRequired(url));
                };
                let switched = {
                    let mut addressing = self.addressing.lock();
                    let direct = *addressing == Addressing::Direct;
                    *addressing = Addressing::Proxied;
                    direct
                };
                if switched {
                    debug!(parent = %parent.usid(), "Switching sub-system list to proxied addressing");
                    continue;
                }
                if !auth_attempted {
                    auth_attempted = true;
                    if parent.authenticate().await {
                        continue;
                    }
                }
                return Err(EngineError::AuthRequired(url));
            }

            let records = SystemRecord::parse_list(&reply)
                .ok_or_else(|| EngineError::Protocol(format!("{url} did not return a system list")))?;
            if let Some(parent) = host_parent {
                if *self.addressing.lock() == Addressing::Proxied {
                    parent.set_proxied(true);
                }
            }
            return Ok(self.reconcile(records));
        }
    }

    /// Bring the member set in line with `records`.
    pub fn reconcile(self: &Arc<Self>, records: Vec<SystemRecord>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let reported: HashSet<&str> = records.iter().map(|r| r.usid.as_str()).collect();

        let gone: Vec<Arc<RemoteSystem>> = {
            let mut state = self.state.lock();
            let owned = std::mem::take(&mut state.owned);
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.systems)
                .into_iter()
                .partition(|s| owned.contains(s.usid()) && !reported.contains(s.usid()));
            state.systems = kept;
            state.owned = owned;
            gone
        };
        for system in gone {
            report.removed.push(system.usid().to_string());
            self.release(&system);
        }

        let parent = self.parent();
        let inherit_proxied = parent.as_ref().map(|p| p.proxied()).unwrap_or(false);
        let mut fresh_hosts = Vec::new();
        for mut record in records {
            record.enabled = Some(!self.disabled.lock().contains(&record.usid));
            if let Some(parent_usid) = &self.parent_usid {
                record.parent_usid = Some(parent_usid.clone());
            }

            if let Some(existing) = self.get_by_usid(&record.usid) {
                if existing.update(&record) {
                    report.updated.push(record.usid.clone());
                }
                continue;
            }

            let system = RemoteSystem::new(record, parent.as_ref(), self.ctx.clone());
            if inherit_proxied {
                system.set_proxied(true);
            }
            report.added.push(system.usid().to_string());
            self.watch_status(&system);
            if system.kind() == SystemKind::Host && system.enabled() && system.host().is_some() {
                fresh_hosts.push(system.clone());
            }
            {
                let mut state = self.state.lock();
                state.owned.insert(system.usid().to_string());
                state.systems.push(system.clone());
            }
            if self.checking.load(Ordering::SeqCst) {
                system.start_checking();
            }
        }

        if report.changed() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                "System tree changed"
            );
            self.emit(TreeEvent::Changed);
            self.forward_to_root();
        }
        self.watch_self_system();
        self.emit(TreeEvent::StatesRefreshed);

        if self.parent.is_none() {
            for host in fresh_hosts {
                self.load_sub_systems(&host);
            }
        }
        report
    }

    /// Splice members of a child tree right after `parent`.
    ///
    /// Self systems and members already present are skipped. Returns the
    /// number of inserted entries.
    pub fn add_sub_systems(self: &Arc<Self>, parent: &RemoteSystem, children: &[Arc<RemoteSystem>]) -> usize {
        let mut inserted = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(mut index) = state.systems.iter().position(|s| s.usid() == parent.usid()) else {
                return 0;
            };
            for child in children {
                if child.kind() == SystemKind::SelfSystem {
                    continue;
                }
                if state.systems.iter().any(|s| s.usid() == child.usid()) {
                    continue;
                }
                index += 1;
                state.systems.insert(index, child.clone());
                inserted.push(child.clone());
            }
        }
        for child in &inserted {
            self.watch_status(child);
            if self.checking.load(Ordering::SeqCst) {
                child.start_checking();
            }
        }
        if !inserted.is_empty() {
            self.emit(TreeEvent::Changed);
        }
        inserted.len()
    }

    /// Mirror a child tree into this one: drop spliced members the child no
    /// longer has and splice the new ones.
    fn sync_sub_systems(self: &Arc<Self>, parent: &RemoteSystem, children: &[Arc<RemoteSystem>]) {
        let keep: HashSet<&str> = children.iter().map(|c| c.usid()).collect();
        let dropped: Vec<Arc<RemoteSystem>> = {
            let mut state = self.state.lock();
            let (dropped, kept) = std::mem::take(&mut state.systems)
                .into_iter()
                .partition(|s| s.parent_usid() == Some(parent.usid()) && !keep.contains(s.usid()));
            state.systems = kept;
            dropped
        };
        for system in &dropped {
            self.forget(system);
        }
        if self.add_sub_systems(parent, children) == 0 && !dropped.is_empty() {
            self.emit(TreeEvent::Changed);
        }
    }

    fn load_sub_systems(self: &Arc<Self>, host: &Arc<RemoteSystem>) {
        let child = SystemTree::scoped(host, self);
        host.set_children(child.clone());
        tokio::spawn(async move {
            if let Err(err) = child.refresh().await {
                warn!(error = %err, "Failed to load sub-systems");
            }
        });
    }

    fn forward_to_root(&self) {
        let (Some(root), Some(parent)) = (
            self.root.as_ref().and_then(Weak::upgrade),
            self.parent(),
        ) else {
            return;
        };
        root.sync_sub_systems(&parent, &self.systems());
    }

    fn watch_status(self: &Arc<Self>, system: &Arc<RemoteSystem>) {
        if !system.kind().is_live() {
            return;
        }
        let mut events = system.subscribe();
        let tree = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SystemEvent::StatusChanged { .. }) => {
                        let Some(tree) = tree.upgrade() else {
                            break;
                        };
                        tree.emit(TreeEvent::StatusesUpdated);
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.add_watcher(system.usid(), task);
    }

    fn watch_self_system(self: &Arc<Self>) {
        let Some(system) = self.self_system() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if state.self_usid.as_deref() == Some(system.usid()) {
                return;
            }
            state.self_usid = Some(system.usid().to_string());
        }
        self.emit(TreeEvent::SelfSystemLoaded(system.usid().to_string()));

        let mut events = system.subscribe();
        let tree = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SystemEvent::SystemsUpdated) => {
                        let Some(tree) = tree.upgrade() else {
                            break;
                        };
                        if let Err(err) = tree.refresh().await {
                            warn!(error = %err, "Failed to refresh system tree");
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.add_watcher(system.usid(), task);
    }

    fn add_watcher(&self, usid: &str, task: JoinHandle<()>) {
        self.state
            .lock()
            .watchers
            .entry(usid.to_string())
            .or_default()
            .push(task);
    }

    /// Stop watching `system` without destroying it.
    fn forget(&self, system: &RemoteSystem) {
        let watchers = {
            let mut state = self.state.lock();
            if state.active.as_ref().map(|a| a.usid()) == Some(system.usid()) {
                state.active = None;
            }
            state.owned.remove(system.usid());
            state.watchers.remove(system.usid())
        };
        for task in watchers.into_iter().flatten() {
            task.abort();
        }
    }

    /// Stop watching `system`, destroy it, and drop its spliced children.
    fn release(&self, system: &Arc<RemoteSystem>) {
        self.forget(system);
        {
            let mut state = self.state.lock();
            if state.self_usid.as_deref() == Some(system.usid()) {
                state.self_usid = None;
            }
        }
        system.destroy();
        if system.kind() == SystemKind::Host {
            let orphans: Vec<Arc<RemoteSystem>> = {
                let mut state = self.state.lock();
                let state = &mut *state;
                let (orphans, kept) = std::mem::take(&mut state.systems)
                    .into_iter()
                    .partition(|s| s.parent_usid() == Some(system.usid()) && !state.owned.contains(s.usid()));
                state.systems = kept;
                orphans
            };
            for orphan in &orphans {
                self.forget(orphan);
            }
        }
    }

    pub fn set_active(&self, usid: &str) -> Option<Arc<RemoteSystem>> {
        let system = self.get_by_usid(usid)?;
        let old = {
            let mut state = self.state.lock();
            state.active.replace(system.clone())
        };
        system.set_active();
        self.emit(TreeEvent::ActiveChanged {
            old: old.map(|s| s.usid().to_string()),
            new: system.usid().to_string(),
        });
        Some(system)
    }

    /// Active system, defaulting to the self system.
    pub fn active(&self) -> Option<Arc<RemoteSystem>> {
        if let Some(active) = self.state.lock().active.clone() {
            return Some(active);
        }
        let selected = self.self_system()?;
        self.state.lock().active = Some(selected.clone());
        Some(selected)
    }

    /// Ask the server to drop a system; the entity named in the reply is removed.
    pub async fn remove_system(&self, usid: &str) -> Result<Option<String>, EngineError> {
        let request = JobRequest::get(format!("/system/remove/{usid}")).timeout(self.ctx.settings.request_timeout);
        let reply = self.ctx.transport.send(request).await.into_result()?;
        let Some(removed) = reply.get("usid").and_then(value_as_string) else {
            return Ok(None);
        };
        let system = {
            let mut state = self.state.lock();
            let position = state.systems.iter().position(|s| s.usid() == removed);
            position.map(|index| state.systems.remove(index))
        };
        if let Some(system) = system {
            self.release(&system);
            self.emit(TreeEvent::Changed);
        }
        Ok(Some(removed))
    }

    /// Register a remote host and re-fetch the list.
    pub async fn add_host(self: &Arc<Self>, name: &str, host: &str) -> Result<ReconcileReport, EngineError> {
        let request = JobRequest::post("/system/add/host")
            .timeout(self.ctx.settings.request_timeout)
            .param("usn", name)
            .param("host", host);
        let reply = self.ctx.transport.send(request).await.into_result()?;
        if is_auth_error(&reply) {
            return Err(EngineError::AuthRequired("/system/add/host".to_string()));
        }
        self.refresh().await
    }

    /// Build a comparison template from the given systems.
    pub async fn create_template(self: &Arc<Self>, usids: &[String]) -> Result<Value, EngineError> {
        let mut request = JobRequest::post("/templates/create")
            .timeout(self.ctx.settings.request_timeout)
            .param("count", usids.len().to_string());
        for (index, usid) in usids.iter().enumerate() {
            request = request.param(format!("usid{index}"), usid.clone());
        }
        let reply = self.ctx.transport.send(request).await.into_result()?;
        if is_auth_error(&reply) {
            return Err(EngineError::AuthRequired("/templates/create".to_string()));
        }
        Ok(reply)
    }

    /// Persist enabled flags and, optionally, a new display order.
    ///
    /// Returns the disabled USIDs for the caller to store.
    pub async fn save_states(&self, order: Option<&[String]>) -> Result<Vec<String>, EngineError> {
        {
            let systems = self.systems();
            let mut disabled = self.disabled.lock();
            for system in &systems {
                if system.enabled() {
                    disabled.remove(system.usid());
                } else {
                    disabled.insert(system.usid().to_string());
                }
            }
        }

        if let Some(order) = order {
            let joined = {
                let mut state = self.state.lock();
                let rank = |s: &Arc<RemoteSystem>| order.iter().position(|u| u == s.usid());
                state.systems.sort_by_key(|s| rank(s).unwrap_or(usize::MAX));
                state
                    .systems
                    .iter()
                    .map(|s| s.usid())
                    .collect::<Vec<_>>()
                    .join(";")
            };
            let request = JobRequest::get("/systems/setOrder")
                .timeout(self.ctx.settings.request_timeout)
                .param("order", joined);
            self.ctx.transport.send(request).await.into_result()?;
        }

        self.emit(TreeEvent::StatesRefreshed);
        Ok(self.disabled_systems())
    }

    pub fn start_checking(&self) {
        self.checking.store(true, Ordering::SeqCst);
        for system in self.systems() {
            system.start_checking();
        }
    }

    pub fn stop_checking(&self, force_self: bool) {
        if force_self {
            self.checking.store(false, Ordering::SeqCst);
        }
        for system in self.systems() {
            system.stop_checking(force_self);
        }
    }

    /// Destroy every member and clear the tree.
    pub fn destroy(&self) {
        self.checking.store(false, Ordering::SeqCst);
        let (systems, owned, watchers) = {
            let mut state = self.state.lock();
            state.active = None;
            state.self_usid = None;
            (
                std::mem::take(&mut state.systems),
                std::mem::take(&mut state.owned),
                std::mem::take(&mut state.watchers),
            )
        };
        for task in watchers.into_values().flatten() {
            task.abort();
        }
        for system in systems {
            if owned.contains(system.usid()) {
                system.destroy();
            }
        }
    }

    fn emit(&self, event: TreeEvent) {
        let _ = self.events.send(event);
    }
}
