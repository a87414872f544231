use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineSettings, RetryPolicy};

/// Configuration for the console engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_job_retry")]
    pub job_retry: RetrySettings,

    #[serde(default = "default_job_retry")]
    pub job_poll: RetrySettings,

    #[serde(default = "default_job_retry")]
    pub job_fetch: RetrySettings,

    #[serde(default = "default_slow_retry")]
    pub tree_retry: RetrySettings,

    #[serde(default = "default_slow_retry")]
    pub history_retry: RetrySettings,

    #[serde(default)]
    pub disabled_systems: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.delay_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            request_timeout_ms: default_request_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
            job_retry: default_job_retry(),
            job_poll: default_job_retry(),
            job_fetch: default_job_retry(),
            tree_retry: default_slow_retry(),
            history_retry: default_slow_retry(),
            disabled_systems: Vec::new(),
        }
    }
}

impl Config {
    /// Runtime knobs handed to every engine component.
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            check_interval: Duration::from_millis(self.check_interval_ms),
            submit_retry: self.job_retry.policy(),
            poll_retry: self.job_poll.policy(),
            fetch_retry: self.job_fetch.policy(),
            tree_retry: self.tree_retry.policy(),
            history_retry: self.history_retry.policy(),
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:8880".to_string()
}

fn default_request_timeout_ms() -> u64 {
    8_000
}

fn default_check_interval_ms() -> u64 {
    5_000
}

fn default_job_retry() -> RetrySettings {
    RetrySettings {
        max_retries: 10,
        delay_ms: 1_000,
    }
}

fn default_slow_retry() -> RetrySettings {
    RetrySettings {
        max_retries: 20,
        delay_ms: 3_000,
    }
}
