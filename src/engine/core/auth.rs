use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::engine::helpers::fix_url;
use crate::engine::models::RemoteSystem;

/// External login flow (credential form plus key exchange).
///
/// A successful flow stores the obtained token in the shared [`TokenStore`].
#[async_trait]
pub trait AuthFlow: Send + Sync {
    async fn authenticate(&self, system: Arc<RemoteSystem>) -> bool;
}

#[derive(Default)]
struct Tokens {
    session: Option<String>,
    hosts: HashMap<String, Option<String>>,
}

/// Auth tokens shared by every entity, keyed by root host.
#[derive(Default)]
pub struct TokenStore {
    inner: RwLock<Tokens>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key under which a collector reachable at `host` stores its token.
    pub fn host_key(host: &str) -> String {
        root_host(&fix_url(host))
    }

    pub fn register_host(&self, host: &str) {
        let key = Self::host_key(host);
        if key.is_empty() {
            return;
        }
        self.inner.write().hosts.entry(key).or_insert(None);
    }

    pub fn set_session_token(&self, token: impl Into<String>) {
        self.inner.write().session = Some(token.into());
    }

    pub fn set_host_token(&self, host: &str, token: impl Into<String>) {
        let key = Self::host_key(host);
        if key.is_empty() {
            return;
        }
        self.inner.write().hosts.insert(key, Some(token.into()));
    }

    pub fn session_token(&self) -> Option<String> {
        self.inner.read().session.clone()
    }

    /// Token for a request URL: relative URLs use the session token,
    /// absolute ones only a token stored for their root host.
    pub fn resolve(&self, url: &str) -> Option<String> {
        let host = root_host(url);
        let tokens = self.inner.read();
        if host.is_empty() {
            return tokens.session.clone();
        }
        tokens.hosts.get(&host).cloned().flatten()
    }
}

/// `scheme://authority` of an absolute URL, else everything before the first `/`.
pub fn root_host(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let scheme_end = url.find("://").map(|idx| idx + 3).unwrap_or(0);
        let authority_end = url[scheme_end..]
            .find('/')
            .map(|idx| scheme_end + idx)
            .unwrap_or(url.len());
        return url[..authority_end].to_string();
    }
    url.split('/').next().unwrap_or_default().to_string()
}
