//! Persistence for shop credentials and sync state.
//!
//! Two backends implement the same traits: PostgreSQL for deployments and an
//! in-memory map for local runs without a database. Both provide atomic
//! per-shop conditional updates, which is what the refresh and sync paths
//! rely on for mutual exclusion across processes.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::MemoryStore;
pub use models::{
    AccessToken, ReplaceOutcome, ShopSyncStatus, SyncOutcome, SyncState, TokenSummary,
};
pub use postgres::PgStore;

/// One access credential per shop.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_token(&self, shop_id: i64) -> Result<Option<AccessToken>>;

    /// Insert or overwrite the shop's credential (first authorization or re-authorization).
    async fn save_token(&self, token: &AccessToken) -> Result<()>;

    /// Replace `previous` with `next` only if the stored refresh token is still
    /// `previous.refresh_token`.
    async fn replace_token(
        &self,
        previous: &AccessToken,
        next: &AccessToken,
    ) -> Result<ReplaceOutcome>;

    /// Every shop that currently has a stored credential.
    async fn list_shop_ids(&self) -> Result<Vec<i64>>;
}

/// Result of a successful `try_begin_sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBegun {
    pub status: ShopSyncStatus,
    /// True when a stale run was reclaimed rather than an idle shop started.
    pub took_over: bool,
}

/// Per-shop ingestion run state.
#[async_trait]
pub trait SyncStatusStore: Send + Sync {
    async fn get_status(&self, shop_id: i64) -> Result<Option<ShopSyncStatus>>;

    /// Atomically set `is_syncing` from false to true, creating the record on
    /// first use. A run started before `stale_before` counts as abandoned and
    /// may be taken over. Returns `None` when another run holds the flag.
    async fn try_begin_sync(
        &self,
        shop_id: i64,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<SyncBegun>>;

    /// Atomically end the current run. Returns `None` when no run is active.
    async fn finish_sync(
        &self,
        shop_id: i64,
        outcome: &SyncOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<ShopSyncStatus>>;
}
