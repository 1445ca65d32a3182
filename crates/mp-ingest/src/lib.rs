//! Event Source Adapter — reconnecting ingestion of upstream
//! market-activity frames, with jittered exponential backoff, heartbeat
//! watchdog, and a parse-error-ratio circuit breaker.

pub mod adapter;
pub mod config;
pub mod error;
pub mod health;
pub mod http_source;
pub mod mock;

pub use adapter::{EventSource, FrameParser, FrameStream, IngestAdapter, RawFrame};
pub use config::AdapterConfig;
pub use error::{IngestError, Result};
pub use health::{
    AggregatedHealth, IngestHealth, IngestHealthService, IngestHealthSnapshot, IngestHealthStatus,
    IngestProcessorHealth, IngestStatus,
};
pub use http_source::HttpEventSource;
pub use mock::MockEventSource;
