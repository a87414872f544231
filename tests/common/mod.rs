//! Shared fixtures: a scripted in-memory transport and context builders.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use zyppmon_engine::engine::{
    EngineContext, EngineSettings, JobRequest, Outcome, RetryPolicy, TokenStore, Transport,
};

type Handler = Box<dyn Fn(&JobRequest) -> Outcome + Send + Sync>;

enum Reply {
    Ready(Outcome),
    Held(oneshot::Receiver<Outcome>),
}

/// Answers requests from per-URL queues; a sticky fallback (or `Failed`)
/// is used once a queue runs dry.
#[derive(Default)]
pub struct ScriptedTransport {
    queues: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallbacks: Mutex<HashMap<String, Handler>>,
    log: Mutex<Vec<JobRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, url: &str, outcome: Outcome) {
        self.queues
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(Reply::Ready(outcome));
    }

    pub fn push_json(&self, url: &str, value: Value) {
        self.push(url, Outcome::Completed(value));
    }

    /// Queue a reply that only resolves once the returned sender fires.
    pub fn hold(&self, url: &str) -> oneshot::Sender<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.queues
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(Reply::Held(rx));
        tx
    }

    pub fn always(&self, url: &str, outcome: Outcome) {
        self.fallbacks
            .lock()
            .insert(url.to_string(), Box::new(move |_| outcome.clone()));
    }

    pub fn always_with<F>(&self, url: &str, handler: F)
    where
        F: Fn(&JobRequest) -> Outcome + Send + Sync + 'static,
    {
        self.fallbacks.lock().insert(url.to_string(), Box::new(handler));
    }

    pub fn requests(&self) -> Vec<JobRequest> {
        self.log.lock().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<JobRequest> {
        self.log.lock().iter().filter(|r| r.url == url).cloned().collect()
    }

    pub fn count(&self, url: &str) -> usize {
        self.log.lock().iter().filter(|r| r.url == url).count()
    }
}

impl ScriptedTransport {
    fn next_reply(&self, url: &str) -> Option<Reply> {
        self.queues.lock().get_mut(url).and_then(VecDeque::pop_front)
    }

    fn fallback(&self, request: &JobRequest) -> Outcome {
        match self.fallbacks.lock().get(&request.url) {
            Some(handler) => handler(request),
            None => Outcome::Failed,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: JobRequest) -> Outcome {
        self.log.lock().push(request.clone());
        match self.next_reply(&request.url) {
            Some(Reply::Ready(outcome)) => outcome,
            Some(Reply::Held(rx)) => rx.await.unwrap_or(Outcome::Aborted),
            None => self.fallback(&request),
        }
    }
}

/// Short, deterministic timings for paused-clock tests.
pub fn fast_settings() -> EngineSettings {
    let quick = RetryPolicy::new(3, Duration::from_millis(100));
    EngineSettings {
        request_timeout: Duration::from_secs(1),
        check_interval: Duration::from_secs(5),
        submit_retry: quick,
        poll_retry: quick,
        fetch_retry: quick,
        tree_retry: quick,
        history_retry: quick,
    }
}

pub fn context(transport: &Arc<ScriptedTransport>) -> EngineContext {
    EngineContext::new(transport.clone(), Arc::new(TokenStore::new()), fast_settings())
}

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
