//! Batch refresh across all connected shops.
//!
//! Invoked by the in-process daemon every `interval` or by the cron HTTP
//! trigger. Each shop is refreshed in its own task under a concurrency limit;
//! a shop's failure is recorded in the report and never stops the others.
//! The run budget is checked before each shop is dispatched, and refreshes
//! already in flight are allowed to finish.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::manager::{is_valid, RefreshAttempt, TokenLifecycleManager};
use crate::config::RefreshSettings;
use crate::error::{Result, ServiceError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshFailure {
    pub shop_id: i64,
    pub error: String,
    pub retryable: bool,
}

/// Aggregate outcome of one scheduler run.
///
/// `success_count + failed_count == processed - skipped_count`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub run_id: String,
    pub processed: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub deadline_exceeded: bool,
    pub failures: Vec<RefreshFailure>,
}

#[derive(Debug)]
enum ShopOutcome {
    Refreshed,
    Skipped(&'static str),
    Failed(ServiceError),
}

impl RefreshReport {
    fn record(&mut self, shop_id: i64, outcome: ShopOutcome) {
        self.processed += 1;
        match outcome {
            ShopOutcome::Refreshed => self.success_count += 1,
            ShopOutcome::Skipped(reason) => {
                debug!(shop_id, reason, "Shop skipped");
                self.skipped_count += 1;
            }
            ShopOutcome::Failed(e) => {
                self.failed_count += 1;
                self.failures.push(RefreshFailure {
                    shop_id,
                    error: e.root().to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }
}

pub struct RefreshScheduler {
    manager: Arc<TokenLifecycleManager>,
    settings: RefreshSettings,
}

impl RefreshScheduler {
    pub fn new(manager: Arc<TokenLifecycleManager>, settings: RefreshSettings) -> Self {
        let mut settings = settings;
        // The threshold must also cover the manager's own buffer.
        settings.buffer_minutes = settings.buffer_minutes.max(manager.buffer_minutes());
        Self {
            manager,
            settings: settings.normalized(),
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Run once with the configured budget.
    pub async fn run(&self) -> Result<RefreshReport> {
        self.run_until(Instant::now() + self.settings.deadline).await
    }

    /// Run once, dispatching no new shop after `deadline`.
    ///
    /// Only listing the connected shops can fail the whole run.
    pub async fn run_until(&self, deadline: Instant) -> Result<RefreshReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("refresh_run", run_id = %run_id);
        self.run_inner(run_id, deadline).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, deadline: Instant) -> Result<RefreshReport> {
        let shop_ids = self.manager.connected_shops().await?;
        let threshold = self.settings.threshold_minutes;
        info!(shops = shop_ids.len(), threshold_minutes = threshold, "Refresh run started");

        let mut report = RefreshReport {
            run_id,
            ..Default::default()
        };
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();
        let mut task_shops = HashMap::new();

        for shop_id in shop_ids {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => permit
                    .map_err(|e| ServiceError::Internal(format!("refresh semaphore closed: {e}")))?,
                _ = tokio::time::sleep_until(deadline) => {
                    report.deadline_exceeded = true;
                    break;
                }
            };
            if Instant::now() >= deadline {
                report.deadline_exceeded = true;
                break;
            }

            let manager = self.manager.clone();
            let handle = tasks.spawn(
                async move {
                    let outcome = refresh_shop(&manager, shop_id, threshold).await;
                    drop(permit);
                    outcome
                }
                .in_current_span(),
            );
            task_shops.insert(handle.id(), shop_id);
        }

        if report.deadline_exceeded {
            warn!(
                dispatched = task_shops.len(),
                "Refresh run budget exhausted, remaining shops wait for the next run"
            );
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    let shop_id = task_shops.get(&id).copied().unwrap_or_default();
                    report.record(shop_id, outcome);
                }
                Err(e) => {
                    let shop_id = task_shops.get(&e.id()).copied().unwrap_or_default();
                    error!(shop_id, "Refresh task aborted: {e}");
                    report.record(
                        shop_id,
                        ShopOutcome::Failed(ServiceError::Internal(format!("refresh task aborted: {e}"))),
                    );
                }
            }
        }

        info!(
            processed = report.processed,
            refreshed = report.success_count,
            failed = report.failed_count,
            skipped = report.skipped_count,
            deadline_exceeded = report.deadline_exceeded,
            "Refresh run finished"
        );
        Ok(report)
    }
}

async fn refresh_shop(manager: &TokenLifecycleManager, shop_id: i64, threshold: i64) -> ShopOutcome {
    let token = match manager.get_stored_token(shop_id).await {
        Ok(Some(token)) => token,
        Ok(None) => return ShopOutcome::Skipped("disconnected"),
        Err(e) => return ShopOutcome::Failed(e),
    };

    if is_valid(&token, threshold) {
        return ShopOutcome::Skipped("still_valid");
    }

    match manager.try_refresh(shop_id, threshold).await {
        Ok(RefreshAttempt::Refreshed(_)) => ShopOutcome::Refreshed,
        Ok(RefreshAttempt::StillValid) => ShopOutcome::Skipped("still_valid"),
        Ok(RefreshAttempt::InProgress) => ShopOutcome::Skipped("in_progress"),
        Err(e) => ShopOutcome::Failed(e),
    }
}

/// Start the refresh daemon loop.
pub async fn refresh_daemon(scheduler: Arc<RefreshScheduler>) {
    let interval = scheduler.settings().interval;
    info!(
        interval_secs = interval.as_secs(),
        threshold_minutes = scheduler.settings().threshold_minutes,
        "Token refresh daemon started"
    );

    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = scheduler.run().await {
            error!("Refresh run error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::gateway::testing::{Behavior, ScriptedGateway};
    use crate::store::{AccessToken, MemoryStore, TokenStore};
    use chrono::{Duration, Utc};

    fn token(shop_id: i64, minutes_left: i64) -> AccessToken {
        AccessToken {
            access_token: format!("at-{shop_id}"),
            refresh_token: format!("rt-{shop_id}-0"),
            expire_in: 14_400,
            expired_at: Some(Utc::now() + Duration::minutes(minutes_left)),
            shop_id,
            merchant_id: None,
            request_id: None,
        }
    }

    fn settings() -> RefreshSettings {
        RefreshSettings {
            interval: std::time::Duration::from_secs(5 * 60),
            buffer_minutes: 5,
            threshold_minutes: 10,
            deadline: std::time::Duration::from_secs(30),
            concurrency: 3,
            daemon_enabled: false,
        }
    }

    fn setup(gateway: ScriptedGateway) -> (Arc<MemoryStore>, Arc<ScriptedGateway>, RefreshScheduler) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(gateway);
        let manager = Arc::new(TokenLifecycleManager::new(
            store.clone(),
            gateway.clone(),
            EventLog::tracing_only(),
        ));
        (store, gateway, RefreshScheduler::new(manager, settings()))
    }

    #[tokio::test]
    async fn test_refreshes_expiring_and_skips_healthy() {
        let (store, gw, scheduler) = setup(ScriptedGateway::new());
        store.save_token(&token(1, 3)).await.unwrap();
        store.save_token(&token(2, 20)).await.unwrap();

        let report = scheduler.run().await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.success_count, 1);
        assert_eq!(report.skipped_count, 1);
        assert_eq!(report.failed_count, 0);
        assert!(!report.deadline_exceeded);

        assert_eq!(gw.refresh_calls(1), 1);
        assert_eq!(gw.refresh_calls(2), 0);
        assert_ne!(store.get_token(1).await.unwrap().unwrap().refresh_token, "rt-1-0");
        assert_eq!(store.get_token(2).await.unwrap().unwrap().refresh_token, "rt-2-0");
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (store, gw, scheduler) = setup(ScriptedGateway::new());
        for shop_id in 1..=6 {
            store.save_token(&token(shop_id, 1)).await.unwrap();
        }
        store.save_token(&token(7, 120)).await.unwrap();
        gw.set(2, Behavior::RejectGrant);
        gw.set(5, Behavior::Unreachable);

        let report = scheduler.run().await.unwrap();
        assert_eq!(report.processed, 7);
        assert_eq!(report.skipped_count, 1);
        assert_eq!(report.failed_count, 2);
        assert_eq!(report.success_count + report.failed_count, report.processed - report.skipped_count);

        let mut failed: Vec<_> = report.failures.iter().map(|f| (f.shop_id, f.retryable)).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![(2, false), (5, true)]);

        for shop_id in [1, 3, 4, 6] {
            let stored = store.get_token(shop_id).await.unwrap().unwrap();
            assert_ne!(stored.refresh_token, format!("rt-{shop_id}-0"), "shop {shop_id}");
        }
        for shop_id in [2, 5] {
            let stored = store.get_token(shop_id).await.unwrap().unwrap();
            assert_eq!(stored.refresh_token, format!("rt-{shop_id}-0"), "shop {shop_id}");
        }
    }

    #[tokio::test]
    async fn test_shop_with_refresh_in_flight_is_skipped() {
        let (store, gw, scheduler) = setup(ScriptedGateway::new());
        store.save_token(&token(1, 1)).await.unwrap();

        let _held = scheduler.manager.locks_for_test().acquire(1).await;
        let report = scheduler.run().await.unwrap();
        assert_eq!(report.skipped_count, 1);
        assert_eq!(report.success_count, 0);
        assert_eq!(gw.refresh_calls(1), 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_dispatches_nothing() {
        let (store, gw, scheduler) = setup(ScriptedGateway::new());
        store.save_token(&token(1, 1)).await.unwrap();
        store.save_token(&token(2, 1)).await.unwrap();

        let report = scheduler.run_until(Instant::now()).await.unwrap();
        assert!(report.deadline_exceeded);
        assert_eq!(report.processed, 0);
        assert_eq!(gw.refresh_calls(1) + gw.refresh_calls(2), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_returns_partial_report() {
        let (store, _gw, scheduler) =
            setup(ScriptedGateway::new().with_delay(std::time::Duration::from_secs(10)));
        for shop_id in 1..=6 {
            store.save_token(&token(shop_id, 1)).await.unwrap();
        }

        // Three permits: the first wave starts, the second would start after 10s.
        let report = scheduler
            .run_until(Instant::now() + std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert!(report.deadline_exceeded);
        assert_eq!(report.processed, 3);
        assert_eq!(report.success_count, 3);
    }

    #[test]
    fn test_threshold_never_below_interval_plus_buffer() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(
            TokenLifecycleManager::new(
                store,
                Arc::new(ScriptedGateway::new()),
                EventLog::tracing_only(),
            )
            .with_buffer_minutes(8),
        );
        let scheduler = RefreshScheduler::new(
            manager,
            RefreshSettings {
                threshold_minutes: 1,
                ..settings()
            },
        );
        assert_eq!(scheduler.settings().threshold_minutes, 13);
    }
}
