//! Interest Index — who should ever hear about a wallet, a market, or
//! every event (`add`/`remove`/`interested`).
//!
//! Grounded on the `DashMap`/`DashSet` concurrent-registry style used for
//! process pools; the matching itself mirrors a subscription matcher: an
//! event is matched against the union of its wallet key, its market key,
//! and the global broadcast key, with recipient ids deduplicated across
//! the three.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use mp_common::Event;

/// In-process interest index. Rebuilt from `RecipientProfile` state at
/// startup (see `mp-router::lifecycle`'s warmup step) and kept current by
/// `add`/`remove` calls from the Recipient Preference API.
#[derive(Default)]
pub struct InterestIndex {
    by_wallet: DashMap<String, DashSet<String>>,
    by_market: DashMap<String, DashSet<String>>,
    global: DashSet<String>,
    read_errors: AtomicU64,
}

impl InterestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `recipient_id` against every wallet/market it tracks.
    /// Idempotent: adding the same pair twice is a no-op the second time.
    pub fn add(&self, recipient_id: &str, wallets: &[String], markets: &[String]) {
        for wallet in wallets {
            self.by_wallet
                .entry(wallet.clone())
                .or_default()
                .insert(recipient_id.to_string());
        }
        for market in markets {
            self.by_market
                .entry(market.clone())
                .or_default()
                .insert(recipient_id.to_string());
        }
    }

    /// Registers `recipient_id` to receive every event regardless of
    /// subject wallet/market (a recipient with no tracked entities at all
    /// still wants kind-level notifications).
    pub fn add_global(&self, recipient_id: &str) {
        self.global.insert(recipient_id.to_string());
    }

    /// Removes every trace of `recipient_id` from the index. Idempotent.
    pub fn remove(&self, recipient_id: &str) {
        self.global.remove(recipient_id);
        self.by_wallet.retain(|_, set| {
            set.remove(recipient_id);
            !set.is_empty()
        });
        self.by_market.retain(|_, set| {
            set.remove(recipient_id);
            !set.is_empty()
        });
    }

    /// Recipients interested in `event`: the deduplicated union of its
    /// wallet subscribers, its market subscribers, and the global set.
    pub fn interested(&self, event: &Event) -> Vec<String> {
        let mut seen: DashSet<String> = DashSet::new();
        let mut out = Vec::new();

        let mut push = |id: &str, seen: &DashSet<String>, out: &mut Vec<String>| {
            if seen.insert(id.to_string()) {
                out.push(id.to_string());
            }
        };

        if let Some(wallet) = &event.subject_wallet {
            if let Some(set) = self.by_wallet.get(wallet) {
                for id in set.iter() {
                    push(&id, &seen, &mut out);
                }
            }
        }
        if let Some(market) = &event.subject_market {
            if let Some(set) = self.by_market.get(market) {
                for id in set.iter() {
                    push(&id, &seen, &mut out);
                }
            }
        }
        for id in self.global.iter() {
            push(&id, &seen, &mut out);
        }

        out
    }

    /// Incremented by callers whose backing read (e.g. a profile-store
    /// fetch during warmup) failed; a failed read drops that recipient
    /// from the index rather than aborting the rebuild.
    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    pub fn wallet_count(&self) -> usize {
        self.by_wallet.len()
    }

    pub fn market_count(&self) -> usize {
        self.by_market.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mp_common::EventKind;

    fn event(wallet: Option<&str>, market: Option<&str>) -> Event {
        Event {
            event_id: "e1".to_string(),
            kind: EventKind::Transaction,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
            subject_wallet: wallet.map(str::to_string),
            subject_market: market.map(str::to_string),
            ingest_seq: 0,
        }
    }

    #[test]
    fn matches_wallet_market_and_global_without_duplicates() {
        let idx = InterestIndex::new();
        idx.add("r1", &["wallet-a".to_string()], &[]);
        idx.add("r2", &[], &["market-a".to_string()]);
        idx.add_global("r3");
        // r1 also happens to track market-a, so it must appear once only.
        idx.add("r1", &[], &["market-a".to_string()]);

        let matched = idx.interested(&event(Some("wallet-a"), Some("market-a")));
        assert_eq!(matched.len(), 3);
        assert!(matched.contains(&"r1".to_string()));
        assert!(matched.contains(&"r2".to_string()));
        assert!(matched.contains(&"r3".to_string()));
    }

    #[test]
    fn remove_is_idempotent_and_drops_empty_sets() {
        let idx = InterestIndex::new();
        idx.add("r1", &["wallet-a".to_string()], &[]);
        idx.remove("r1");
        idx.remove("r1");
        assert_eq!(idx.wallet_count(), 0);
        assert!(idx.interested(&event(Some("wallet-a"), None)).is_empty());
    }
}
