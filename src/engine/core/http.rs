use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::engine::api::{JobRequest, Method};
use crate::engine::helpers::AUTH_HEADER;
use crate::types::{EngineError, TransportFailure};

use super::auth::TokenStore;

/// Categorized result of one request. Never retried by the transport itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Aborted,
    Failed,
    TimedOut,
}

impl Outcome {
    pub fn into_result(self) -> Result<Value, EngineError> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Aborted => Err(TransportFailure::Aborted.into()),
            Outcome::Failed => Err(TransportFailure::Failed.into()),
            Outcome::TimedOut => Err(TransportFailure::TimedOut.into()),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: JobRequest) -> Outcome;
}

/// reqwest-backed transport talking to the console server and host collectors.
#[derive(Clone)]
pub struct HttpJobClient {
    http: Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    default_timeout: Duration,
}

impl HttpJobClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<TokenStore>,
        default_timeout: Duration,
    ) -> Result<Self, EngineError> {
        // Host collectors commonly serve self-signed certificates on 8843.
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(EngineError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            tokens,
            default_timeout,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    fn absolute_url(&self, url: &str) -> String {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return url.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Transport for HttpJobClient {
    async fn send(&self, request: JobRequest) -> Outcome {
        let token = if request.authenticated {
            self.tokens.resolve(&request.url)
        } else {
            None
        };
        let url = self.absolute_url(&request.url);

        let mut builder = match request.method {
            Method::Get => self.http.get(&url).query(&request.params),
            Method::Post => self.http.post(&url).form(&request.params),
        };
        builder = builder.timeout(request.timeout.unwrap_or(self.default_timeout));
        if let Some(token) = token {
            builder = builder.header(AUTH_HEADER, token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return classify(&url, err),
        };
        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Request returned non-success status");
            return Outcome::Failed;
        }
        match response.json::<Value>().await {
            Ok(value) => Outcome::Completed(value),
            Err(err) => classify(&url, err),
        }
    }
}

fn classify(url: &str, err: reqwest::Error) -> Outcome {
    debug!(url = %url, error = %err, "Request did not complete");
    if err.is_timeout() {
        Outcome::TimedOut
    } else if err.is_body() {
        Outcome::Aborted
    } else {
        Outcome::Failed
    }
}
