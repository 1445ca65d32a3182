//! Alerting — the generalized `AlertSink` trait from the external
//! interfaces (`trait AlertSink { notify(alert) }`), with one concrete
//! webhook implementation shipped in-repo.
//!
//! Grounded on the teacher's Teams notification service: a batching
//! wrapper collects warnings over a short window and forwards a single
//! digest instead of firing one HTTP call per warning, which is what kept
//! a noisy warning source from hammering the webhook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mp_common::{Warning, WarningSeverity};
use tokio::sync::Mutex;
use tracing::{error, warn};

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, warning: &Warning);
}

/// Drops every warning. Used when no alerting endpoint is configured.
pub struct NoOpAlertSink;

#[async_trait]
impl AlertSink for NoOpAlertSink {
    async fn notify(&self, _warning: &Warning) {}
}

/// Posts a JSON payload to a chat webhook for `Error`/`Critical` warnings.
/// `Info`/`Warn` warnings are visible through `/monitoring` already and
/// aren't worth paging anyone over.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookAlertSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, warning: &Warning) {
        if !matches!(warning.severity, WarningSeverity::Error | WarningSeverity::Critical) {
            return;
        }

        let body = serde_json::json!({
            "text": format!(
                "[{:?}/{:?}] {} (source: {})",
                warning.severity, warning.category, warning.message, warning.source
            ),
        });

        if let Err(e) = self.client.post(&self.webhook_url).json(&body).send().await {
            warn!(error = %e, "failed to deliver alert webhook");
        }
    }
}

/// Wraps another sink and coalesces warnings arriving within `window` into
/// one digest call, so a burst of identical warnings produces one webhook
/// post instead of dozens.
pub struct BatchingAlertSink {
    inner: Arc<dyn AlertSink>,
    pending: Mutex<Vec<Warning>>,
    window: Duration,
}

impl BatchingAlertSink {
    pub fn new(inner: Arc<dyn AlertSink>, window: Duration) -> Arc<Self> {
        let sink = Arc::new(Self {
            inner,
            pending: Mutex::new(Vec::new()),
            window,
        });
        sink.clone().spawn_flusher();
        sink
    }

    fn spawn_flusher(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.window);
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        });
    }

    async fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        if batch.len() == 1 {
            self.inner.notify(&batch[0]).await;
            return;
        }

        let worst = batch
            .iter()
            .max_by_key(|w| severity_rank(w.severity))
            .expect("batch checked non-empty above")
            .clone();
        let digest = Warning::new(
            worst.category,
            worst.severity,
            format!("{} related warnings in the last window, most recent: {}", batch.len(), worst.message),
            worst.source.clone(),
        );
        self.inner.notify(&digest).await;
    }
}

fn severity_rank(severity: WarningSeverity) -> u8 {
    match severity {
        WarningSeverity::Info => 0,
        WarningSeverity::Warn => 1,
        WarningSeverity::Error => 2,
        WarningSeverity::Critical => 3,
    }
}

#[async_trait]
impl AlertSink for BatchingAlertSink {
    async fn notify(&self, warning: &Warning) {
        let mut pending = self.pending.lock().await;
        if pending.len() >= 256 {
            error!("alert batch buffer full, dropping oldest warning");
            pending.remove(0);
        }
        pending.push(warning.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_common::WarningCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn notify(&self, _warning: &Warning) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn noop_sink_never_panics() {
        let sink = NoOpAlertSink;
        let warning = Warning::new(WarningCategory::Dispatch, WarningSeverity::Critical, "m".to_string(), "s".to_string());
        sink.notify(&warning).await;
    }

    #[tokio::test]
    async fn batching_sink_collapses_burst_into_one_flush() {
        let counting = Arc::new(CountingSink { calls: AtomicUsize::new(0) });
        let batching = BatchingAlertSink::new(counting.clone(), Duration::from_millis(20));

        for _ in 0..5 {
            batching.notify(&Warning::new(WarningCategory::Queue, WarningSeverity::Error, "m".to_string(), "s".to_string())).await;
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }
}
