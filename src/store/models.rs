//! Persisted records: one access credential and one sync status per shop.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, ServiceError};

/// Delegated marketplace credential for one shop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds of validity at issuance.
    pub expire_in: i64,
    /// Absent means the token is treated as non-expiring.
    pub expired_at: Option<DateTime<Utc>>,
    pub shop_id: i64,
    pub merchant_id: Option<i64>,
    /// Correlation id of the exchange call that produced this token.
    pub request_id: Option<String>,
}

impl AccessToken {
    /// Absolute expiry for a token issued at `issued_at` with `expire_in` seconds of validity.
    ///
    /// `None` or `0` means non-expiring. Negative or out-of-range values are
    /// rejected as a malformed exchange response.
    pub fn expiry_from(
        issued_at: DateTime<Utc>,
        expire_in: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>> {
        match expire_in {
            None | Some(0) => Ok(None),
            Some(secs) if secs > 0 => Duration::try_seconds(secs)
                .and_then(|ttl| issued_at.checked_add_signed(ttl))
                .map(Some)
                .ok_or_else(invalid_expire_in),
            Some(_) => Err(invalid_expire_in()),
        }
    }

    /// Metadata-only view, safe to return to the dashboard.
    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            shop_id: self.shop_id,
            merchant_id: self.merchant_id,
            expire_in: self.expire_in,
            expired_at: self.expired_at,
            request_id: self.request_id.clone(),
        }
    }
}

fn invalid_expire_in() -> ServiceError {
    ServiceError::Auth("exchange response has invalid expire_in".into())
}

// Secrets stay out of logs.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expire_in", &self.expire_in)
            .field("expired_at", &self.expired_at)
            .field("shop_id", &self.shop_id)
            .field("merchant_id", &self.merchant_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub shop_id: i64,
    pub merchant_id: Option<i64>,
    pub expire_in: i64,
    pub expired_at: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
}

/// Outcome of a compare-and-set token replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    /// Another writer rotated the token first; carries the record now stored.
    Superseded(AccessToken),
    /// The shop was disconnected while the refresh was in flight.
    Missing,
}

/// Background ingestion run state for one shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopSyncStatus {
    pub shop_id: i64,
    pub is_syncing: bool,
    pub is_initial_sync_done: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub total_synced: u64,
    pub last_error: Option<String>,
    pub sync_started_at: Option<DateTime<Utc>>,
}

impl ShopSyncStatus {
    /// Status of a shop that has never synced.
    pub fn idle(shop_id: i64) -> Self {
        Self {
            shop_id,
            is_syncing: false,
            is_initial_sync_done: false,
            last_sync_at: None,
            total_synced: 0,
            last_error: None,
            sync_started_at: None,
        }
    }

    pub fn state(&self) -> SyncState {
        if self.is_syncing {
            SyncState::Syncing
        } else if self.last_error.is_some() {
            SyncState::Error
        } else {
            SyncState::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }
}

/// How a sync run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { synced: u64 },
    Failed { error: String },
}

/// Largest running total either backend can hold (BIGINT in Postgres).
pub const MAX_TOTAL_SYNCED: u64 = i64::MAX as u64;

impl SyncOutcome {
    /// Apply this outcome to a status that is currently syncing.
    ///
    /// A completion that would push `total_synced` past [`MAX_TOTAL_SYNCED`]
    /// is rejected and leaves `status` untouched.
    pub fn apply(&self, status: &mut ShopSyncStatus, at: DateTime<Utc>) -> Result<()> {
        match self {
            SyncOutcome::Completed { synced } => {
                let total = status
                    .total_synced
                    .checked_add(*synced)
                    .filter(|total| *total <= MAX_TOTAL_SYNCED)
                    .ok_or_else(|| {
                        ServiceError::InvalidRequest(format!(
                            "synced count {synced} overflows total_synced"
                        ))
                    })?;
                status.last_sync_at = Some(at);
                status.total_synced = total;
                status.last_error = None;
                status.is_initial_sync_done = true;
            }
            SyncOutcome::Failed { error } => {
                status.last_error = Some(error.clone());
            }
        }
        status.is_syncing = false;
        status.sync_started_at = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syncing(shop_id: i64) -> ShopSyncStatus {
        ShopSyncStatus {
            is_syncing: true,
            sync_started_at: Some(Utc::now()),
            ..ShopSyncStatus::idle(shop_id)
        }
    }

    #[test]
    fn test_expiry_from_positive_ttl() {
        let issued = Utc::now();
        assert_eq!(
            AccessToken::expiry_from(issued, Some(14_400)).unwrap(),
            Some(issued + Duration::seconds(14_400))
        );
    }

    #[test]
    fn test_out_of_range_ttl_is_rejected() {
        let issued = Utc::now();
        for secs in [i64::MAX / 1000, i64::MAX, -1] {
            assert!(matches!(
                AccessToken::expiry_from(issued, Some(secs)),
                Err(ServiceError::Auth(_))
            ));
        }
    }

    #[test]
    fn test_missing_or_zero_ttl_never_expires() {
        let issued = Utc::now();
        assert_eq!(AccessToken::expiry_from(issued, None).unwrap(), None);
        assert_eq!(AccessToken::expiry_from(issued, Some(0)).unwrap(), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let token = AccessToken {
            access_token: "at-secret".into(),
            refresh_token: "rt-secret".into(),
            expire_in: 60,
            expired_at: None,
            shop_id: 1,
            merchant_id: None,
            request_id: None,
        };
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("at-secret"));
        assert!(!rendered.contains("rt-secret"));
        assert!(rendered.contains("shop_id: 1"));
    }

    #[test]
    fn test_complete_sets_initial_done_and_adds() {
        let mut status = syncing(1);
        status.total_synced = 10;
        status.last_error = Some("boom".into());
        let at = Utc::now();
        SyncOutcome::Completed { synced: 42 }.apply(&mut status, at).unwrap();
        assert_eq!(status.total_synced, 52);
        assert!(status.is_initial_sync_done);
        assert_eq!(status.last_error, None);
        assert_eq!(status.last_sync_at, Some(at));
        assert_eq!(status.state(), SyncState::Idle);
    }

    #[test]
    fn test_failure_keeps_counters() {
        let mut status = syncing(1);
        status.total_synced = 10;
        status.is_initial_sync_done = true;
        SyncOutcome::Failed { error: "rate limited".into() }
            .apply(&mut status, Utc::now())
            .unwrap();
        assert_eq!(status.total_synced, 10);
        assert!(status.is_initial_sync_done);
        assert_eq!(status.state(), SyncState::Error);
    }

    #[test]
    fn test_total_overflow_rejected_without_change() {
        let mut status = syncing(1);
        status.total_synced = MAX_TOTAL_SYNCED - 1;
        let before = status.clone();

        let err = SyncOutcome::Completed { synced: 2 }
            .apply(&mut status, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert_eq!(status, before);

        SyncOutcome::Completed { synced: 1 }.apply(&mut status, Utc::now()).unwrap();
        assert_eq!(status.total_synced, MAX_TOTAL_SYNCED);
    }
}
