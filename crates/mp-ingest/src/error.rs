use thiserror::Error;

/// Errors surfaced by the event source adapter.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to parse upstream frame: {0}")]
    Parse(String),

    #[error("parse-error-ratio circuit breaker is open")]
    CircuitOpen,

    #[error("upstream requested backoff: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("adapter is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, IngestError>;
