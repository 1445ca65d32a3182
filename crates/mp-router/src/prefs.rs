//! Preference Filter — the ordered stage chain that decides what happens
//! to a candidate `Notification`: `Enabled -> Kind enabled -> Threshold ->
//! Relevance -> Quiet hours -> Deduplication -> Per-recipient frequency`.
//!
//! Grounded on the classification-chain style of the teacher's mediation
//! layer (a sequence of independent checks, first non-pass wins) and its
//! threshold types in the data model.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use mp_common::{Event, EventKind, Notification, Priority, RecipientProfile};
use mp_queue::QueueStore;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterVerdict {
    Pass,
    Drop(DropReason),
    Defer(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RecipientDisabled,
    KindDisabled,
    BelowThreshold,
    NotRelevant,
    Duplicate,
}

/// Stateful stages (dedup, per-recipient frequency) live behind this
/// struct; the rest of the chain is pure and could be free functions, but
/// keeping them as methods keeps the one ordered call site simple.
pub struct PreferenceFilter {
    store: Arc<dyn QueueStore>,
    dedup_ttl_seconds: u64,
    /// Rolling per-recipient send timestamps for the frequency stage.
    recent_sends: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl PreferenceFilter {
    pub fn new(store: Arc<dyn QueueStore>, dedup_ttl_seconds: u64) -> Self {
        Self {
            store,
            dedup_ttl_seconds,
            recent_sends: DashMap::new(),
        }
    }

    pub async fn evaluate(
        &self,
        notification: &Notification,
        profile: &RecipientProfile,
        event: &Event,
        now: DateTime<Utc>,
    ) -> mp_common::Result<FilterVerdict> {
        if !profile.enabled {
            return Ok(FilterVerdict::Drop(DropReason::RecipientDisabled));
        }
        if !profile.kinds.enabled_for(notification.kind) {
            return Ok(FilterVerdict::Drop(DropReason::KindDisabled));
        }
        if !passes_threshold(event, profile) {
            return Ok(FilterVerdict::Drop(DropReason::BelowThreshold));
        }
        if !is_relevant(event, profile) {
            return Ok(FilterVerdict::Drop(DropReason::NotRelevant));
        }
        if notification.priority != Priority::Urgent {
            if let Some(until) = quiet_hours_defer(profile, now) {
                return Ok(FilterVerdict::Defer(until));
            }
        }

        let duplicate = self
            .store
            .check_and_record_dedup(&profile.recipient_id, &notification.dedup_key, self.dedup_ttl_seconds)
            .await
            .map_err(|e| mp_common::PipelineError::Queue(e.to_string()))?;
        if duplicate {
            return Ok(FilterVerdict::Drop(DropReason::Duplicate));
        }

        if let Some(until) = self.frequency_defer(&profile.recipient_id, profile.max_per_minute, now) {
            return Ok(FilterVerdict::Defer(until));
        }

        Ok(FilterVerdict::Pass)
    }

    fn frequency_defer(&self, recipient_id: &str, max_per_minute: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let entry = self
            .recent_sends
            .entry(recipient_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut sends = entry.lock();

        let window = Duration::from_secs(60);
        let cutoff = Instant::now()
            .checked_sub(window)
            .unwrap_or_else(Instant::now);
        while sends.front().map(|t| *t < cutoff).unwrap_or(false) {
            sends.pop_front();
        }

        if sends.len() as u32 >= max_per_minute.max(1) {
            let oldest = *sends.front().expect("non-empty when at capacity");
            let wait = window.saturating_sub(oldest.elapsed());
            return Some(now + chrono::Duration::from_std(wait).unwrap_or_default());
        }

        sends.push_back(Instant::now());
        None
    }
}

fn passes_threshold(event: &Event, profile: &RecipientProfile) -> bool {
    match event.kind {
        EventKind::Transaction => match profile.thresholds.min_transaction_amount {
            Some(min) => magnitude(event, "amount").map(|v| v >= min).unwrap_or(true),
            None => true,
        },
        EventKind::PositionUpdate => match profile.thresholds.min_position_size {
            Some(min) => magnitude(event, "size").map(|v| v >= min).unwrap_or(true),
            None => true,
        },
        EventKind::PriceUpdate | EventKind::VolumeUpdate => match profile.thresholds.min_price_change_pct {
            Some(min) => magnitude(event, "pct_change").map(|v| v.abs() >= min).unwrap_or(true),
            None => true,
        },
        EventKind::Resolution => true,
    }
}

fn magnitude(event: &Event, field: &str) -> Option<f64> {
    event.payload.get(field).and_then(|v| v.as_f64())
}

/// A recipient with no tracked wallets and no tracked markets is
/// considered globally relevant (it relies solely on kind preferences).
/// Otherwise the event's subject must match at least one tracked list.
fn is_relevant(event: &Event, profile: &RecipientProfile) -> bool {
    if profile.tracked_wallets.is_empty() && profile.tracked_markets.is_empty() {
        return true;
    }
    let wallet_match = event
        .subject_wallet
        .as_ref()
        .is_some_and(|w| profile.tracked_wallets.iter().any(|t| t == w));
    let market_match = event
        .subject_market
        .as_ref()
        .is_some_and(|m| profile.tracked_markets.iter().any(|t| t == m));
    wallet_match || market_match
}

/// Returns the instant quiet hours lift, if `now` (converted to the
/// profile's time zone) falls inside the configured window.
fn quiet_hours_defer(profile: &RecipientProfile, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !profile.quiet_hours.enabled {
        return None;
    }
    let tz: Tz = profile.quiet_hours.time_zone.parse().unwrap_or(chrono_tz::UTC);
    let local = now.with_timezone(&tz);
    let minute_of_day = local.hour() * 60 + local.minute();

    let (start, end) = (profile.quiet_hours.start_minute as u32, profile.quiet_hours.end_minute as u32);
    let in_window = if start <= end {
        minute_of_day >= start && minute_of_day < end
    } else {
        // Window wraps past midnight, e.g. 22:00-06:00.
        minute_of_day >= start || minute_of_day < end
    };

    if !in_window {
        return None;
    }

    let minutes_until_end = if end > minute_of_day {
        end - minute_of_day
    } else {
        (24 * 60 - minute_of_day) + end
    };
    Some(now + chrono::Duration::minutes(minutes_until_end as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_common::{Correlation, QuietHours, Thresholds};
    use mp_queue::SqliteQueueStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> Arc<dyn QueueStore> {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteQueueStore::new(pool, 100);
        store.init_schema().await.unwrap();
        Arc::new(store)
    }

    fn event(wallet: Option<&str>, payload: serde_json::Value) -> Event {
        Event {
            event_id: "e1".to_string(),
            kind: EventKind::Transaction,
            occurred_at: Utc::now(),
            payload,
            subject_wallet: wallet.map(str::to_string),
            subject_market: None,
            ingest_seq: 0,
        }
    }

    fn notif(recipient: &str, priority: Priority) -> Notification {
        Notification {
            notif_id: "n1".to_string(),
            recipient_id: recipient.to_string(),
            kind: EventKind::Transaction,
            priority,
            title: "t".to_string(),
            body: "b".to_string(),
            dedup_key: "dk1".to_string(),
            created_at: Utc::now(),
            scheduled_for: Utc::now(),
            attempts: 0,
            correlation: Correlation {
                event_id: "e1".to_string(),
                subject_wallet: None,
                subject_market: None,
            },
        }
    }

    #[tokio::test]
    async fn disabled_recipient_is_dropped() {
        let filter = PreferenceFilter::new(test_store().await, 60);
        let mut profile = RecipientProfile::new("r1");
        profile.enabled = false;
        let verdict = filter
            .evaluate(&notif("r1", Priority::Medium), &profile, &event(None, serde_json::json!({})), Utc::now())
            .await
            .unwrap();
        assert_eq!(verdict, FilterVerdict::Drop(DropReason::RecipientDisabled));
    }

    #[tokio::test]
    async fn below_threshold_is_dropped() {
        let filter = PreferenceFilter::new(test_store().await, 60);
        let mut profile = RecipientProfile::new("r1");
        profile.thresholds = Thresholds { min_transaction_amount: Some(1000.0), min_position_size: None, min_price_change_pct: None };
        let ev = event(None, serde_json::json!({"amount": 10.0}));
        let verdict = filter.evaluate(&notif("r1", Priority::Medium), &profile, &ev, Utc::now()).await.unwrap();
        assert_eq!(verdict, FilterVerdict::Drop(DropReason::BelowThreshold));
    }

    #[tokio::test]
    async fn second_identical_dedup_key_is_dropped() {
        let filter = PreferenceFilter::new(test_store().await, 60);
        let profile = RecipientProfile::new("r1");
        let ev = event(None, serde_json::json!({}));
        let first = filter.evaluate(&notif("r1", Priority::Medium), &profile, &ev, Utc::now()).await.unwrap();
        let second = filter.evaluate(&notif("r1", Priority::Medium), &profile, &ev, Utc::now()).await.unwrap();
        assert_eq!(first, FilterVerdict::Pass);
        assert_eq!(second, FilterVerdict::Drop(DropReason::Duplicate));
    }

    #[test]
    fn quiet_hours_defers_non_urgent_only() {
        let mut profile = RecipientProfile::new("r1");
        profile.quiet_hours = QuietHours {
            enabled: true,
            start_minute: 0,
            end_minute: 24 * 60 - 1,
            time_zone: "UTC".to_string(),
        };
        assert!(quiet_hours_defer(&profile, Utc::now()).is_some());
    }
}
