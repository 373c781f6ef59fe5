use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, ServiceError};
use crate::events::{CredentialEvent, EventKind, EventLog};
use crate::store::{ShopSyncStatus, SyncOutcome, SyncStatusStore};

/// Guards ingestion runs: at most one active run per shop.
///
/// Transitions are single conditional updates in the store, so two callers
/// racing on `start` cannot both win even across processes.
pub struct SyncStatusTracker {
    store: Arc<dyn SyncStatusStore>,
    events: EventLog,
    stale_after: Option<Duration>,
}

impl SyncStatusTracker {
    pub fn new(store: Arc<dyn SyncStatusStore>, events: EventLog) -> Self {
        Self {
            store,
            events,
            stale_after: None,
        }
    }

    /// Allow `start` to reclaim runs older than `stale_after`.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Idle/Error → Syncing.
    pub async fn start(&self, shop_id: i64) -> Result<ShopSyncStatus> {
        let now = Utc::now();
        let stale_before = self
            .stale_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now - d);

        let Some(begun) = self.store.try_begin_sync(shop_id, now, stale_before).await? else {
            return Err(ServiceError::Conflict(format!(
                "sync already running for shop {shop_id}"
            )));
        };

        if begun.took_over {
            warn!(shop_id, "Reclaimed stale sync run");
            self.emit(shop_id, EventKind::SyncTakenOver, json!({})).await;
        } else {
            info!(shop_id, "Sync started");
            self.emit(shop_id, EventKind::SyncStarted, json!({})).await;
        }

        Ok(begun.status)
    }

    /// Syncing → Idle, adding `synced_count` to the running total.
    pub async fn complete(&self, shop_id: i64, synced_count: u64) -> Result<ShopSyncStatus> {
        let status = self
            .finish(shop_id, "complete", SyncOutcome::Completed { synced: synced_count })
            .await?;

        info!(shop_id, synced_count, total = status.total_synced, "Sync completed");
        self.emit(
            shop_id,
            EventKind::SyncCompleted,
            json!({ "synced_count": synced_count, "total_synced": status.total_synced }),
        )
        .await;
        Ok(status)
    }

    /// Syncing → Error. Counters are left untouched.
    pub async fn fail(&self, shop_id: i64, error: &str) -> Result<ShopSyncStatus> {
        let status = self
            .finish(shop_id, "fail", SyncOutcome::Failed { error: error.to_string() })
            .await?;

        warn!(shop_id, error, "Sync failed");
        self.emit(shop_id, EventKind::SyncFailed, json!({ "error": error })).await;
        Ok(status)
    }

    /// Current status; a shop that never synced reads as idle.
    pub async fn query(&self, shop_id: i64) -> Result<ShopSyncStatus> {
        Ok(self
            .store
            .get_status(shop_id)
            .await?
            .unwrap_or_else(|| ShopSyncStatus::idle(shop_id)))
    }

    async fn finish(
        &self,
        shop_id: i64,
        action: &'static str,
        outcome: SyncOutcome,
    ) -> Result<ShopSyncStatus> {
        if let Some(status) = self.store.finish_sync(shop_id, &outcome, Utc::now()).await? {
            return Ok(status);
        }

        let state = self.query(shop_id).await?.state();
        Err(ServiceError::InvalidTransition {
            shop_id,
            action,
            state: state.as_str(),
        })
    }

    async fn emit(&self, shop_id: i64, kind: EventKind, metadata: serde_json::Value) {
        self.events
            .emit(CredentialEvent::new(shop_id, kind, metadata))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SyncState};

    fn tracker() -> (Arc<MemoryStore>, SyncStatusTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = SyncStatusTracker::new(store.clone(), EventLog::new(store.clone()));
        (store, tracker)
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let (_store, tracker) = tracker();
        let before = tracker.query(1).await.unwrap().total_synced;

        tracker.start(1).await.unwrap();
        let err = tracker.start(1).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let status = tracker.complete(1, 42).await.unwrap();
        assert_eq!(status.total_synced, before + 42);
        assert!(!status.is_syncing);
        assert_eq!(tracker.query(1).await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_concurrent_starts_have_one_winner() {
        let (_store, tracker) = tracker();
        let tracker = Arc::new(tracker);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move { tracker.start(3).await }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(ServiceError::Conflict(_)) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(wins, 1);
        assert!(tracker.query(3).await.unwrap().is_syncing);
    }

    #[tokio::test]
    async fn test_fail_keeps_progress() {
        let (_store, tracker) = tracker();
        tracker.start(1).await.unwrap();
        tracker.complete(1, 10).await.unwrap();

        tracker.start(1).await.unwrap();
        let status = tracker.fail(1, "marketplace 500").await.unwrap();
        assert_eq!(status.total_synced, 10);
        assert!(status.is_initial_sync_done);
        assert!(!status.is_syncing);
        assert_eq!(status.last_error.as_deref(), Some("marketplace 500"));
        assert_eq!(status.state(), SyncState::Error);

        // Error → Syncing → Idle clears the error.
        tracker.start(1).await.unwrap();
        let status = tracker.complete(1, 0).await.unwrap();
        assert_eq!(status.last_error, None);
        assert_eq!(status.total_synced, 10);
    }

    #[tokio::test]
    async fn test_finish_without_start_is_invalid_transition() {
        let (_store, tracker) = tracker();
        match tracker.complete(9, 1).await.unwrap_err() {
            ServiceError::InvalidTransition { shop_id, action, state } => {
                assert_eq!((shop_id, action, state), (9, "complete", "idle"));
            }
            other => panic!("unexpected {other:?}"),
        }

        tracker.start(9).await.unwrap();
        tracker.fail(9, "boom").await.unwrap();
        match tracker.fail(9, "again").await.unwrap_err() {
            ServiceError::InvalidTransition { state, .. } => assert_eq!(state, "error"),
            other => panic!("unexpected {other:?}"),
        }
        // The rejected call did not overwrite the recorded error.
        assert_eq!(tracker.query(9).await.unwrap().last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_query_unknown_shop_is_idle() {
        let (_store, tracker) = tracker();
        let status = tracker.query(77).await.unwrap();
        assert_eq!(status, ShopSyncStatus::idle(77));
    }

    #[tokio::test]
    async fn test_stale_run_takeover_only_when_enabled() {
        let store = Arc::new(MemoryStore::new());
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        store.try_begin_sync(4, long_ago, None).await.unwrap();

        let strict = SyncStatusTracker::new(store.clone(), EventLog::tracing_only());
        assert!(matches!(strict.start(4).await, Err(ServiceError::Conflict(_))));

        let lenient = SyncStatusTracker::new(store.clone(), EventLog::new(store.clone()))
            .with_stale_after(Some(Duration::from_secs(60 * 60)));
        let status = lenient.start(4).await.unwrap();
        assert!(status.is_syncing);
        assert!(status.sync_started_at.unwrap() > long_ago);

        let kinds: Vec<_> = store.events().await.into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::SyncTakenOver]);
    }

    #[tokio::test]
    async fn test_transitions_emit_events() {
        let (store, tracker) = tracker();
        tracker.start(1).await.unwrap();
        tracker.complete(1, 5).await.unwrap();
        tracker.start(1).await.unwrap();
        tracker.fail(1, "x").await.unwrap();

        let kinds: Vec<_> = store.events().await.into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::SyncStarted,
                EventKind::SyncCompleted,
                EventKind::SyncStarted,
                EventKind::SyncFailed,
            ]
        );
    }
}
