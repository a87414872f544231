use thiserror::Error;

/// Transport-level outcome categories that never carry a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Aborted,
    Failed,
    TimedOut,
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportFailure::Aborted => "request aborted",
            TransportFailure::Failed => "request failed",
            TransportFailure::TimedOut => "request timed out",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(TransportFailure),
    #[error("authentication required: {0}")]
    AuthRequired(String),
    #[error("protocol mismatch: {0}")]
    Protocol(String),
    #[error("{operation} abandoned after {attempts} attempts")]
    Abandoned {
        operation: &'static str,
        attempts: u32,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Only transport failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}

impl From<TransportFailure> for EngineError {
    fn from(value: TransportFailure) -> Self {
        EngineError::Transport(value)
    }
}
