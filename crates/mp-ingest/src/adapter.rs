use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use mp_common::Event;

use crate::config::AdapterConfig;
use crate::error::{IngestError, Result};
use crate::health::{IngestHealth, IngestHealthSnapshot};

/// A single raw frame pulled off the upstream transport, not yet parsed
/// into a pipeline `Event`.
pub type RawFrame = Vec<u8>;

/// The opaque upstream collaborator (HTTP/WebSocket source, MQ topic,
/// whatever transport carries market-activity frames). Adapters hand
/// back a stream of raw frames; parsing into `Event` is the adapter's
/// job, not the source's, so the same `EventSource` impl can feed
/// differently-shaped payloads.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FrameStream>>;
}

/// A connected stream of raw frames. `None` means the upstream closed
/// the connection (triggers reconnect); `Some(Err(_))` is a transport
/// error on an otherwise-open connection (also triggers reconnect).
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Option<Result<RawFrame>>;
}

/// Parses a raw upstream frame into a pipeline event. Framed as a trait
/// (rather than a bare closure type) so implementations can hold parser
/// state (e.g. a schema registry) behind `Arc`.
pub trait FrameParser: Send + Sync {
    fn parse(&self, frame: &RawFrame) -> Result<Event>;
}

impl<F> FrameParser for F
where
    F: Fn(&RawFrame) -> Result<Event> + Send + Sync,
{
    fn parse(&self, frame: &RawFrame) -> Result<Event> {
        (self)(frame)
    }
}

/// Reconnecting event source adapter (spec component 1).
///
/// Owns the reconnect-with-backoff loop, heartbeat-miss detection, and
/// the parse-error-ratio circuit breaker; emits parsed `Event`s on
/// `sink` for the Interest Index to consume.
pub struct IngestAdapter {
    name: String,
    config: AdapterConfig,
    source: Arc<dyn EventSource>,
    parser: Arc<dyn FrameParser>,
    sink: mpsc::Sender<Event>,
    health: Arc<IngestHealth>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    /// Epoch millis the mid-stream parse-error-ratio breaker last tripped,
    /// or 0 if closed. Checked and updated from `run_connection`'s frame
    /// loop, independent of the outer reconnect loop's own check.
    breaker_tripped_at_ms: AtomicU64,
}

impl IngestAdapter {
    pub fn new(
        name: impl Into<String>,
        config: AdapterConfig,
        source: Arc<dyn EventSource>,
        parser: Arc<dyn FrameParser>,
        sink: mpsc::Sender<Event>,
    ) -> Self {
        let name = name.into();
        let health = Arc::new(IngestHealth::new(name.clone(), config.parse_error_window));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name,
            config,
            source,
            parser,
            sink,
            health,
            running: AtomicBool::new(false),
            shutdown_tx,
            breaker_tripped_at_ms: AtomicU64::new(0),
        }
    }

    pub fn health(&self) -> Arc<IngestHealth> {
        self.health.clone()
    }

    pub fn stats(&self) -> IngestHealthSnapshot {
        self.health.status()
    }

    /// Runs the reconnect loop until `stop()` is called. Intended to be
    /// spawned as its own task by the Supervisor.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.health.set_running(true);
        info!(source = %self.name, "starting event source adapter");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut consecutive_failures: u32 = 0;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if self.health.parse_error_ratio() > self.config.parse_error_ratio_threshold {
                self.health.set_fatal_error(format!(
                    "parse error ratio {:.3} exceeds threshold {:.3}",
                    self.health.parse_error_ratio(),
                    self.config.parse_error_ratio_threshold
                ));
                error!(source = %self.name, "parse-error-ratio circuit breaker open, pausing ingest");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.circuit_breaker_reset_ms)) => {}
                    _ = shutdown_rx.recv() => break,
                }
                continue;
            }

            tokio::select! {
                result = self.run_connection() => {
                    match result {
                        Ok(()) => {
                            // stream closed cleanly; treat as reconnect-worthy
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            self.health.increment_reconnect_attempts();
                            warn!(source = %self.name, error = %e, attempt = consecutive_failures, "event source connection failed, backing off");
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let backoff = self.backoff_delay(consecutive_failures);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.health.set_running(false);
        info!(source = %self.name, "event source adapter stopped");
        Ok(())
    }

    /// `min(base * multiplier^attempt + U(0, base), max)`, jittered so a
    /// fleet of adapters reconnecting at once doesn't thunder the source.
    fn backoff_delay(&self, attempt: u32) -> u64 {
        let base = self.config.initial_backoff_ms as f64;
        let raw = base * self.config.backoff_multiplier.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.0..base);
        ((raw + jitter) as u64).min(self.config.max_backoff_ms)
    }

    /// `true` if the parse-error-ratio breaker is open and this frame
    /// should be discarded without being parsed or forwarded. Unlike the
    /// outer reconnect loop's check, this runs on every frame of an
    /// already-open connection, so a trip takes effect immediately instead
    /// of only at the next reconnect.
    ///
    /// Once `circuit_breaker_reset_ms` has elapsed since the trip, one
    /// frame is let through as a probe; if the ratio is still over
    /// threshold after that frame's outcome is recorded, the trip
    /// timestamp resets and discarding resumes.
    fn breaker_blocks_frame(&self) -> bool {
        if self.health.parse_error_ratio() <= self.config.parse_error_ratio_threshold {
            self.breaker_tripped_at_ms.store(0, Ordering::SeqCst);
            return false;
        }

        let now = now_ms();
        let tripped_at = self.breaker_tripped_at_ms.load(Ordering::SeqCst);
        if tripped_at == 0 {
            self.breaker_tripped_at_ms.store(now, Ordering::SeqCst);
            warn!(source = %self.name, "parse-error-ratio circuit breaker tripped mid-stream, discarding frames");
            return true;
        }

        if now.saturating_sub(tripped_at) < self.config.circuit_breaker_reset_ms {
            return true;
        }

        // Reset window elapsed: let this one frame through as a probe.
        // If it doesn't bring the ratio back down, the next frame re-trips.
        self.breaker_tripped_at_ms.store(now, Ordering::SeqCst);
        false
    }

    async fn run_connection(&self) -> Result<()> {
        let mut stream = self.source.connect().await?;
        self.health.set_running(true);
        self.health.record_heartbeat();

        let heartbeat_timeout = Duration::from_millis(self.config.heartbeat_interval_ms * 2);
        let healthy_since = std::time::Instant::now();
        let mut reset_done = false;

        loop {
            let frame = tokio::time::timeout(heartbeat_timeout, stream.next_frame()).await;

            let frame = match frame {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => return Ok(()),
                Err(_) => {
                    return Err(IngestError::Transport(format!(
                        "no frame or heartbeat within {}ms",
                        heartbeat_timeout.as_millis()
                    )));
                }
            };

            self.health.record_heartbeat();

            if self.breaker_blocks_frame() {
                continue;
            }

            match self.parser.parse(&frame) {
                Ok(event) => {
                    self.health.record_parse_outcome(true);
                    self.health.record_event();
                    if self.sink.send(event).await.is_err() {
                        debug!(source = %self.name, "downstream sink closed, stopping adapter");
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.health.record_parse_outcome(false);
                    warn!(source = %self.name, error = %e, "failed to parse upstream frame");
                }
            }

            if !reset_done
                && healthy_since.elapsed() >= Duration::from_secs(self.config.healthy_window_secs)
            {
                self.health.reset_reconnect_attempts();
                reset_done = true;
            }
        }
    }

    pub async fn stop(&self) {
        info!(source = %self.name, "stopping event source adapter");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    struct ScriptedStream {
        frames: AsyncMutex<std::collections::VecDeque<Option<Result<RawFrame>>>>,
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Option<Result<RawFrame>> {
            self.frames.lock().await.pop_front().flatten()
        }
    }

    struct ScriptedSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn connect(&self) -> Result<Box<dyn FrameStream>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut frames = std::collections::VecDeque::new();
            frames.push_back(Some(Ok(b"good".to_vec())));
            frames.push_back(None);
            Ok(Box::new(ScriptedStream {
                frames: AsyncMutex::new(frames),
            }))
        }
    }

    fn test_event() -> Event {
        Event {
            event_id: "evt-1".to_string(),
            kind: mp_common::EventKind::Transaction,
            occurred_at: chrono::Utc::now(),
            payload: serde_json::json!({}),
            subject_wallet: None,
            subject_market: None,
            ingest_seq: 0,
        }
    }

    #[tokio::test]
    async fn parses_frames_and_emits_events() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let parser: Arc<dyn FrameParser> = Arc::new(move |_: &RawFrame| Ok(test_event()));
        let adapter = Arc::new(IngestAdapter::new(
            "test",
            AdapterConfig {
                healthy_window_secs: 0,
                ..Default::default()
            },
            source,
            parser,
            tx,
        ));

        let handle = tokio::spawn(adapter.clone().start());
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open");
        assert_eq!(event.event_id, "evt-1");

        adapter.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_eq!(adapter.health().events_received(), 1);
    }

    #[tokio::test]
    async fn tripped_breaker_discards_frames_mid_stream() {
        let adapter = IngestAdapter::new(
            "test",
            AdapterConfig {
                parse_error_ratio_threshold: 0.1,
                parse_error_window: 4,
                circuit_breaker_reset_ms: 60_000,
                ..Default::default()
            },
            Arc::new(ScriptedSource { calls: AtomicUsize::new(0) }),
            Arc::new(|_: &RawFrame| Ok(test_event())),
            mpsc::channel(1).0,
        );

        // Push the ratio over threshold without going through run_connection.
        adapter.health().record_parse_outcome(false);
        adapter.health().record_parse_outcome(false);
        assert!(adapter.health().parse_error_ratio() > 0.1);

        assert!(adapter.breaker_blocks_frame());
        // Reset timeout is long, so the breaker stays open on the next check.
        assert!(adapter.breaker_blocks_frame());
    }

    #[test]
    fn backoff_delay_respects_cap() {
        let adapter = IngestAdapter::new(
            "capped",
            AdapterConfig {
                initial_backoff_ms: 1000,
                backoff_multiplier: 2.0,
                max_backoff_ms: 5000,
                ..Default::default()
            },
            Arc::new(ScriptedSource {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(|_: &RawFrame| Ok(test_event())),
            mpsc::channel(1).0,
        );

        for attempt in 0..10 {
            assert!(adapter.backoff_delay(attempt) <= 5000);
        }
    }
}
