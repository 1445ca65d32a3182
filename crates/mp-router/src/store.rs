//! Recipient profile storage.
//!
//! `RecipientProfile` persistence is one of the "opaque" collaborators
//! (§6's `Store` trait); this module defines the narrow slice of KV
//! operations the pipeline needs against it and ships one in-process,
//! `DashMap`-backed implementation (the same concurrent-registry style
//! `mp-router::interest` and the old pool registry use). A production
//! deployment would point `ProfileStore` at the same database
//! `mp-queue::SqliteQueueStore` already uses; that adapter is not
//! included here since nothing in this repository's scope needs it to
//! differ from the in-memory one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mp_common::{PipelineError, RecipientProfile, Result};
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, recipient_id: &str) -> Result<Option<RecipientProfile>>;
    async fn put(&self, profile: RecipientProfile) -> Result<()>;
    async fn delete(&self, recipient_id: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<RecipientProfile>>;
}

/// One delivered-or-dropped notification, as surfaced by
/// `GET /recipients/{id}/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub recipient_id: String,
    pub notif_id: String,
    pub title: String,
    pub outcome: String,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: HistoryRecord);
    async fn list(&self, recipient_id: &str, limit: usize) -> Result<Vec<HistoryRecord>>;
}

/// Ships with the repository since no concrete history backend is in
/// scope; the HTTP handler still exercises the real trait boundary.
#[derive(Default)]
pub struct NoOpHistorySink;

#[async_trait]
impl HistorySink for NoOpHistorySink {
    async fn record(&self, _record: HistoryRecord) {}

    async fn list(&self, _recipient_id: &str, _limit: usize) -> Result<Vec<HistoryRecord>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<String, RecipientProfile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, recipient_id: &str) -> Result<Option<RecipientProfile>> {
        Ok(self.profiles.get(recipient_id).map(|r| r.clone()))
    }

    async fn put(&self, profile: RecipientProfile) -> Result<()> {
        if profile.recipient_id.is_empty() {
            return Err(PipelineError::Store("recipient_id must not be empty".to_string()));
        }
        self.profiles.insert(profile.recipient_id.clone(), profile);
        Ok(())
    }

    async fn delete(&self, recipient_id: &str) -> Result<bool> {
        Ok(self.profiles.remove(recipient_id).is_some())
    }

    async fn list(&self) -> Result<Vec<RecipientProfile>> {
        Ok(self.profiles.iter().map(|r| r.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = InMemoryProfileStore::new();
        let profile = RecipientProfile::new("r1");
        store.put(profile.clone()).await.unwrap();

        let fetched = store.get("r1").await.unwrap().unwrap();
        assert_eq!(fetched.recipient_id, "r1");

        assert!(store.delete("r1").await.unwrap());
        assert!(store.get("r1").await.unwrap().is_none());
    }
}
