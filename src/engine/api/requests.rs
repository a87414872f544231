use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A single request against the console server or a host collector.
///
/// `url` is either a path relative to the console server (`/systems`) or an
/// absolute host address (`http://h1:8880/check`).
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: String,
    pub method: Method,
    pub timeout: Option<Duration>,
    pub params: Vec<(String, String)>,
    pub authenticated: bool,
}

impl JobRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, Method::Get)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(url, Method::Post)
    }

    fn new(url: impl Into<String>, method: Method) -> Self {
        Self {
            url: url.into(),
            method,
            timeout: None,
            params: Vec::new(),
            authenticated: true,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Requests default to carrying the auth header; unauthenticated endpoints opt out.
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
