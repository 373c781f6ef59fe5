//! PostgreSQL-backed store for shop credentials, sync state and audit events.
//!
//! Tables:
//! - `shop_access_tokens`: encrypted tokens, one row per shop
//! - `shop_sync_status`: ingestion run state, one row per shop
//! - `credential_events`: audit log for authenticate/refresh/sync transitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use super::models::{AccessToken, ReplaceOutcome, ShopSyncStatus, SyncOutcome};
use super::{SyncBegun, SyncStatusStore, TokenStore};
use crate::crypto::{fingerprint, CryptoEngine};
use crate::error::{Result, ServiceError};
use crate::events::{CredentialEvent, EventSink};

const SYNC_COLUMNS: &str = "shop_id, is_syncing, is_initial_sync_done, last_sync_at, \
                            total_synced, last_error, sync_started_at";

/// Postgres `numeric_value_out_of_range`.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

/// Conditional upsert that flips `is_syncing` in one statement.
///
/// The conflict branch only fires when the WHERE clause holds against the
/// locked row, and `taken_over` is copied from that same row in SET, so it
/// reports whether this call displaced a live run.
fn begin_sync_sql() -> String {
    format!(
        r#"
        INSERT INTO shop_sync_status (shop_id, is_syncing, sync_started_at, taken_over, updated_at)
        VALUES ($1, TRUE, $2, FALSE, NOW())
        ON CONFLICT (shop_id) DO UPDATE SET
            is_syncing = TRUE,
            sync_started_at = EXCLUDED.sync_started_at,
            taken_over = shop_sync_status.is_syncing,
            updated_at = NOW()
        WHERE shop_sync_status.is_syncing = FALSE
           OR ($3::timestamptz IS NOT NULL AND shop_sync_status.sync_started_at < $3)
        RETURNING {SYNC_COLUMNS}, taken_over
        "#
    )
}

/// A completion whose addition overflowed BIGINT is the caller's input, not a store fault.
fn completion_error(e: sqlx::Error, synced: i64) -> ServiceError {
    let overflowed = e
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == NUMERIC_OUT_OF_RANGE);
    if overflowed {
        ServiceError::InvalidRequest(format!("synced count {synced} overflows total_synced"))
    } else {
        ServiceError::from(e)
    }
}

/// Credential and sync-state store backed by PostgreSQL.
pub struct PgStore {
    pool: PgPool,
    crypto: Arc<CryptoEngine>,
}

impl PgStore {
    pub async fn new(db_url: &str, crypto: Arc<CryptoEngine>) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(db_url)
            .await
            .map_err(|e| ServiceError::Database(format!("Failed to connect to PostgreSQL: {e}")))?;

        Ok(Self { pool, crypto })
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shop_access_tokens (
                shop_id             BIGINT PRIMARY KEY,
                access_token        TEXT NOT NULL,
                refresh_token       TEXT NOT NULL,
                refresh_fingerprint TEXT NOT NULL,
                expire_in           BIGINT NOT NULL DEFAULT 0,
                expired_at          TIMESTAMPTZ,
                merchant_id         BIGINT,
                request_id          TEXT,
                created_at          TIMESTAMPTZ DEFAULT NOW(),
                updated_at          TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shop_sync_status (
                shop_id              BIGINT PRIMARY KEY,
                is_syncing           BOOLEAN NOT NULL DEFAULT FALSE,
                is_initial_sync_done BOOLEAN NOT NULL DEFAULT FALSE,
                last_sync_at         TIMESTAMPTZ,
                total_synced         BIGINT NOT NULL DEFAULT 0 CHECK (total_synced >= 0),
                last_error           TEXT,
                sync_started_at      TIMESTAMPTZ,
                taken_over           BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at           TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "ALTER TABLE shop_sync_status ADD COLUMN IF NOT EXISTS taken_over BOOLEAN NOT NULL DEFAULT FALSE",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credential_events (
                id          UUID PRIMARY KEY,
                shop_id     BIGINT NOT NULL,
                event_type  TEXT NOT NULL,
                metadata    JSONB DEFAULT '{}',
                created_at  TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_shop_access_tokens_expiry ON shop_access_tokens(expired_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_credential_events_shop ON credential_events(shop_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn token_from_row(&self, row: &PgRow) -> Result<AccessToken> {
        let enc_access: String = row.try_get("access_token")?;
        let enc_refresh: String = row.try_get("refresh_token")?;

        Ok(AccessToken {
            access_token: self.crypto.decrypt(&enc_access)?,
            refresh_token: self.crypto.decrypt(&enc_refresh)?,
            expire_in: row.try_get("expire_in")?,
            expired_at: row.try_get("expired_at")?,
            shop_id: row.try_get("shop_id")?,
            merchant_id: row.try_get("merchant_id")?,
            request_id: row.try_get("request_id")?,
        })
    }
}

fn status_from_row(row: &PgRow) -> Result<ShopSyncStatus> {
    let total: i64 = row.try_get("total_synced")?;

    Ok(ShopSyncStatus {
        shop_id: row.try_get("shop_id")?,
        is_syncing: row.try_get("is_syncing")?,
        is_initial_sync_done: row.try_get("is_initial_sync_done")?,
        last_sync_at: row.try_get("last_sync_at")?,
        total_synced: u64::try_from(total)
            .map_err(|_| ServiceError::Database(format!("negative total_synced: {total}")))?,
        last_error: row.try_get("last_error")?,
        sync_started_at: row.try_get("sync_started_at")?,
    })
}

#[async_trait]
impl TokenStore for PgStore {
    async fn get_token(&self, shop_id: i64) -> Result<Option<AccessToken>> {
        let row = sqlx::query(
            r#"
            SELECT shop_id, access_token, refresh_token, expire_in, expired_at,
                   merchant_id, request_id
            FROM shop_access_tokens
            WHERE shop_id = $1
            "#,
        )
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.token_from_row(&r)).transpose()
    }

    async fn save_token(&self, token: &AccessToken) -> Result<()> {
        let enc_access = self.crypto.encrypt(&token.access_token)?;
        let enc_refresh = self.crypto.encrypt(&token.refresh_token)?;

        sqlx::query(
            r#"
            INSERT INTO shop_access_tokens
                (shop_id, access_token, refresh_token, refresh_fingerprint,
                 expire_in, expired_at, merchant_id, request_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (shop_id)
            DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                refresh_fingerprint = EXCLUDED.refresh_fingerprint,
                expire_in = EXCLUDED.expire_in,
                expired_at = EXCLUDED.expired_at,
                merchant_id = EXCLUDED.merchant_id,
                request_id = EXCLUDED.request_id,
                updated_at = NOW()
            "#,
        )
        .bind(token.shop_id)
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(fingerprint(&token.refresh_token))
        .bind(token.expire_in)
        .bind(token.expired_at)
        .bind(token.merchant_id)
        .bind(&token.request_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_token(
        &self,
        previous: &AccessToken,
        next: &AccessToken,
    ) -> Result<ReplaceOutcome> {
        let enc_access = self.crypto.encrypt(&next.access_token)?;
        let enc_refresh = self.crypto.encrypt(&next.refresh_token)?;

        let affected = sqlx::query(
            r#"
            UPDATE shop_access_tokens
            SET access_token = $2,
                refresh_token = $3,
                refresh_fingerprint = $4,
                expire_in = $5,
                expired_at = $6,
                merchant_id = $7,
                request_id = $8,
                updated_at = NOW()
            WHERE shop_id = $1 AND refresh_fingerprint = $9
            "#,
        )
        .bind(previous.shop_id)
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(fingerprint(&next.refresh_token))
        .bind(next.expire_in)
        .bind(next.expired_at)
        .bind(next.merchant_id)
        .bind(&next.request_id)
        .bind(fingerprint(&previous.refresh_token))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 1 {
            return Ok(ReplaceOutcome::Replaced);
        }

        Ok(match self.get_token(previous.shop_id).await? {
            Some(current) => ReplaceOutcome::Superseded(current),
            None => ReplaceOutcome::Missing,
        })
    }

    async fn list_shop_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT shop_id FROM shop_access_tokens ORDER BY shop_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>(0).map_err(ServiceError::from))
            .collect()
    }
}

#[async_trait]
impl SyncStatusStore for PgStore {
    async fn get_status(&self, shop_id: i64) -> Result<Option<ShopSyncStatus>> {
        let row = sqlx::query(&format!(
            "SELECT {SYNC_COLUMNS} FROM shop_sync_status WHERE shop_id = $1"
        ))
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(status_from_row).transpose()
    }

    async fn try_begin_sync(
        &self,
        shop_id: i64,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<SyncBegun>> {
        let row = sqlx::query(&begin_sync_sql())
            .bind(shop_id)
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(SyncBegun {
            status: status_from_row(&row)?,
            took_over: row.try_get("taken_over")?,
        }))
    }

    async fn finish_sync(
        &self,
        shop_id: i64,
        outcome: &SyncOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<ShopSyncStatus>> {
        let row = match outcome {
            SyncOutcome::Completed { synced } => {
                let synced = i64::try_from(*synced).map_err(|_| {
                    ServiceError::InvalidRequest(format!("synced count out of range: {synced}"))
                })?;
                sqlx::query(&format!(
                    r#"
                    UPDATE shop_sync_status
                    SET is_syncing = FALSE,
                        sync_started_at = NULL,
                        last_sync_at = $2,
                        total_synced = total_synced + $3,
                        last_error = NULL,
                        is_initial_sync_done = TRUE,
                        updated_at = NOW()
                    WHERE shop_id = $1 AND is_syncing = TRUE
                    RETURNING {SYNC_COLUMNS}
                    "#
                ))
                .bind(shop_id)
                .bind(at)
                .bind(synced)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| completion_error(e, synced))?
            }
            SyncOutcome::Failed { error } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE shop_sync_status
                    SET is_syncing = FALSE,
                        sync_started_at = NULL,
                        last_error = $2,
                        updated_at = NOW()
                    WHERE shop_id = $1 AND is_syncing = TRUE
                    RETURNING {SYNC_COLUMNS}
                    "#
                ))
                .bind(shop_id)
                .bind(error)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.as_ref().map(status_from_row).transpose()
    }
}

#[async_trait]
impl EventSink for PgStore {
    async fn record(&self, event: &CredentialEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credential_events (id, shop_id, event_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(uuid::Uuid::new_v4())
        .bind(event.shop_id)
        .bind(event.kind.as_str())
        .bind(&event.metadata)
        .bind(event.at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
