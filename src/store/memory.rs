//! In-memory store used when no database is configured.
//!
//! Every operation takes the relevant map's write lock for its whole
//! check-and-update, which gives the same per-key atomicity as the
//! conditional SQL statements in the Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use super::models::{AccessToken, ReplaceOutcome, ShopSyncStatus, SyncOutcome};
use super::{SyncBegun, SyncStatusStore, TokenStore};
use crate::error::Result;
use crate::events::{CredentialEvent, EventSink};

/// Events kept for inspection; older ones are dropped first.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub struct MemoryStore {
    tokens: RwLock<HashMap<i64, AccessToken>>,
    sync: RwLock<HashMap<i64, ShopSyncStatus>>,
    events: RwLock<VecDeque<CredentialEvent>>,
    event_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            tokens: RwLock::default(),
            sync: RwLock::default(),
            events: RwLock::default(),
            event_capacity,
        }
    }

    /// Remove a shop's credential (explicit disconnect).
    pub async fn remove_token(&self, shop_id: i64) -> Option<AccessToken> {
        self.tokens.write().await.remove(&shop_id)
    }

    /// Snapshot of the most recent events, oldest first.
    pub async fn events(&self) -> Vec<CredentialEvent> {
        self.events.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get_token(&self, shop_id: i64) -> Result<Option<AccessToken>> {
        Ok(self.tokens.read().await.get(&shop_id).cloned())
    }

    async fn save_token(&self, token: &AccessToken) -> Result<()> {
        self.tokens
            .write()
            .await
            .insert(token.shop_id, token.clone());
        Ok(())
    }

    async fn replace_token(
        &self,
        previous: &AccessToken,
        next: &AccessToken,
    ) -> Result<ReplaceOutcome> {
        let mut tokens = self.tokens.write().await;
        match tokens.get(&previous.shop_id) {
            None => Ok(ReplaceOutcome::Missing),
            Some(current) if current.refresh_token != previous.refresh_token => {
                Ok(ReplaceOutcome::Superseded(current.clone()))
            }
            Some(_) => {
                tokens.insert(previous.shop_id, next.clone());
                Ok(ReplaceOutcome::Replaced)
            }
        }
    }

    async fn list_shop_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self.tokens.read().await.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[async_trait]
impl SyncStatusStore for MemoryStore {
    async fn get_status(&self, shop_id: i64) -> Result<Option<ShopSyncStatus>> {
        Ok(self.sync.read().await.get(&shop_id).cloned())
    }

    async fn try_begin_sync(
        &self,
        shop_id: i64,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<SyncBegun>> {
        let mut sync = self.sync.write().await;
        let status = sync
            .entry(shop_id)
            .or_insert_with(|| ShopSyncStatus::idle(shop_id));

        let took_over = if status.is_syncing {
            let abandoned = match (stale_before, status.sync_started_at) {
                (Some(cutoff), Some(started)) => started < cutoff,
                _ => false,
            };
            if !abandoned {
                return Ok(None);
            }
            true
        } else {
            false
        };

        status.is_syncing = true;
        status.sync_started_at = Some(now);

        Ok(Some(SyncBegun {
            status: status.clone(),
            took_over,
        }))
    }

    async fn finish_sync(
        &self,
        shop_id: i64,
        outcome: &SyncOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<ShopSyncStatus>> {
        let mut sync = self.sync.write().await;
        match sync.get_mut(&shop_id) {
            Some(status) if status.is_syncing => {
                outcome.apply(status, at)?;
                Ok(Some(status.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn record(&self, event: &CredentialEvent) -> Result<()> {
        if self.event_capacity == 0 {
            return Ok(());
        }
        let mut events = self.events.write().await;
        while events.len() >= self.event_capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(shop_id: i64, refresh: &str) -> AccessToken {
        AccessToken {
            access_token: format!("at-{refresh}"),
            refresh_token: refresh.into(),
            expire_in: 14_400,
            expired_at: Some(Utc::now() + Duration::hours(4)),
            shop_id,
            merchant_id: Some(900),
            request_id: Some("req-1".into()),
        }
    }

    #[tokio::test]
    async fn test_save_get_roundtrip() {
        let store = MemoryStore::new();
        let t = token(1, "rt-a");
        store.save_token(&t).await.unwrap();
        assert_eq!(store.get_token(1).await.unwrap(), Some(t));
        assert_eq!(store.get_token(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_is_compare_and_set() {
        let store = MemoryStore::new();
        let original = token(1, "rt-a");
        store.save_token(&original).await.unwrap();

        let rotated = token(1, "rt-b");
        assert_eq!(
            store.replace_token(&original, &rotated).await.unwrap(),
            ReplaceOutcome::Replaced
        );

        // A second writer still holding the original loses.
        let late = token(1, "rt-c");
        assert_eq!(
            store.replace_token(&original, &late).await.unwrap(),
            ReplaceOutcome::Superseded(rotated.clone())
        );
        assert_eq!(store.get_token(1).await.unwrap(), Some(rotated));
    }

    #[tokio::test]
    async fn test_replace_does_not_resurrect_disconnected_shop() {
        let store = MemoryStore::new();
        let original = token(1, "rt-a");
        store.save_token(&original).await.unwrap();
        store.remove_token(1).await;
        assert_eq!(
            store.replace_token(&original, &token(1, "rt-b")).await.unwrap(),
            ReplaceOutcome::Missing
        );
        assert_eq!(store.get_token(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_begin_sync_is_exclusive() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store.try_begin_sync(5, now, None).await.unwrap();
        assert!(matches!(first, Some(SyncBegun { took_over: false, .. })));
        assert!(store.try_begin_sync(5, now, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_run_can_be_taken_over() {
        let store = MemoryStore::new();
        let started = Utc::now() - Duration::hours(3);
        store.try_begin_sync(5, started, None).await.unwrap();

        let now = Utc::now();
        let begun = store
            .try_begin_sync(5, now, Some(now - Duration::hours(1)))
            .await
            .unwrap()
            .unwrap();
        assert!(begun.took_over);
        assert_eq!(begun.status.sync_started_at, Some(now));
    }

    #[tokio::test]
    async fn test_finish_requires_active_run() {
        let store = MemoryStore::new();
        let outcome = SyncOutcome::Completed { synced: 3 };
        assert!(store.finish_sync(5, &outcome, Utc::now()).await.unwrap().is_none());

        store.try_begin_sync(5, Utc::now(), None).await.unwrap();
        let status = store
            .finish_sync(5, &outcome, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.total_synced, 3);
        assert!(!status.is_syncing);
        assert!(store.finish_sync(5, &outcome, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_shop_ids_sorted() {
        let store = MemoryStore::new();
        for id in [30, 10, 20] {
            store.save_token(&token(id, "rt")).await.unwrap();
        }
        assert_eq!(store.list_shop_ids().await.unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_event_log_keeps_only_newest() {
        use crate::events::EventKind;

        let store = MemoryStore::with_event_capacity(3);
        for shop_id in 1..=5 {
            let event = CredentialEvent::new(shop_id, EventKind::SyncStarted, serde_json::json!({}));
            store.record(&event).await.unwrap();
        }
        let shops: Vec<i64> = store.events().await.iter().map(|e| e.shop_id).collect();
        assert_eq!(shops, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_overflowing_completion_keeps_run_active() {
        use super::super::models::MAX_TOTAL_SYNCED;

        let store = MemoryStore::new();
        store.try_begin_sync(2, Utc::now(), None).await.unwrap();
        store
            .finish_sync(2, &SyncOutcome::Completed { synced: MAX_TOTAL_SYNCED }, Utc::now())
            .await
            .unwrap();

        store.try_begin_sync(2, Utc::now(), None).await.unwrap();
        let err = store
            .finish_sync(2, &SyncOutcome::Completed { synced: 1 }, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ServiceError::InvalidRequest(_)));

        let status = store.get_status(2).await.unwrap().unwrap();
        assert!(status.is_syncing);
        assert_eq!(status.total_synced, MAX_TOTAL_SYNCED);
    }
}
