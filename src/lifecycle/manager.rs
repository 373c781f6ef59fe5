//! Single-shop token lifecycle: validity checks, authorization-code exchange
//! and refresh under a per-shop exclusive section.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::locks::ShopLocks;
use crate::error::{Result, ServiceError};
use crate::events::{CredentialEvent, EventKind, EventLog};
use crate::gateway::{AuthGateway, ShopContext};
use crate::store::{AccessToken, ReplaceOutcome, TokenStore};

pub const DEFAULT_BUFFER_MINUTES: i64 = 5;

/// Whether `token` is still usable at `now` with `buffer_minutes` of margin.
///
/// A token without `expired_at` never expires. A buffer too large to
/// represent leaves no usable window.
pub fn is_valid_at(token: &AccessToken, buffer_minutes: i64, now: DateTime<Utc>) -> bool {
    match token.expired_at {
        None => true,
        Some(expired_at) => Duration::try_minutes(buffer_minutes)
            .and_then(|buffer| expired_at.checked_sub_signed(buffer))
            .is_some_and(|usable_until| now < usable_until),
    }
}

pub fn is_valid(token: &AccessToken, buffer_minutes: i64) -> bool {
    is_valid_at(token, buffer_minutes, Utc::now())
}

/// Result of a non-blocking refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshAttempt {
    Refreshed(AccessToken),
    /// The stored token was valid for the requested threshold once the section was held.
    StillValid,
    /// Another refresh for this shop holds the section.
    InProgress,
}

pub struct TokenLifecycleManager {
    store: Arc<dyn TokenStore>,
    gateway: Arc<dyn AuthGateway>,
    events: EventLog,
    locks: ShopLocks,
    buffer_minutes: i64,
}

impl TokenLifecycleManager {
    pub fn new(store: Arc<dyn TokenStore>, gateway: Arc<dyn AuthGateway>, events: EventLog) -> Self {
        Self {
            store,
            gateway,
            events,
            locks: ShopLocks::new(),
            buffer_minutes: DEFAULT_BUFFER_MINUTES,
        }
    }

    pub fn with_buffer_minutes(mut self, buffer_minutes: i64) -> Self {
        self.buffer_minutes = buffer_minutes;
        self
    }

    pub fn buffer_minutes(&self) -> i64 {
        self.buffer_minutes
    }

    /// Validity under this manager's buffer.
    pub fn is_valid(&self, token: &AccessToken) -> bool {
        is_valid(token, self.buffer_minutes)
    }

    pub async fn get_stored_token(&self, shop_id: i64) -> Result<Option<AccessToken>> {
        self.store.get_token(shop_id).await
    }

    pub async fn connected_shops(&self) -> Result<Vec<i64>> {
        self.store.list_shop_ids().await
    }

    /// Exchange an authorization code and store the resulting token.
    ///
    /// `shop_id` fills in for an exchange response that omits it.
    pub async fn authenticate(&self, code: &str, shop_id: Option<i64>) -> Result<AccessToken> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ServiceError::InvalidRequest("authorization code is empty".into()));
        }

        let issued_at = Utc::now();
        let token = self
            .gateway
            .exchange_code(code, shop_id)
            .await
            .and_then(|resp| {
                resp.into_access_token(
                    issued_at,
                    ShopContext {
                        shop_id,
                        merchant_id: None,
                    },
                )
            })
            .inspect_err(|e| warn!(?shop_id, "Authorization code exchange failed: {e}"))?;

        let _guard = self.locks.acquire(token.shop_id).await;
        self.store.save_token(&token).await?;

        info!(shop_id = token.shop_id, merchant_id = ?token.merchant_id, "Shop authorized");
        self.events
            .emit(CredentialEvent::new(
                token.shop_id,
                EventKind::Authenticated,
                json!({
                    "merchant_id": token.merchant_id,
                    "expired_at": token.expired_at,
                    "request_id": token.request_id,
                }),
            ))
            .await;

        Ok(token)
    }

    /// Refresh the shop's token, waiting for any refresh already in progress.
    ///
    /// A caller that waited and finds the token already rotated by the holder
    /// returns that token instead of refreshing a second time.
    pub async fn refresh(&self, shop_id: i64) -> Result<AccessToken> {
        let before = self
            .store
            .get_token(shop_id)
            .await
            .map_err(|e| ServiceError::refresh(shop_id, e))?;

        let (_guard, waited) = match self.locks.try_acquire(shop_id).await {
            Some(guard) => (guard, false),
            None => {
                debug!(shop_id, "Refresh already in progress, waiting");
                (self.locks.acquire(shop_id).await, true)
            }
        };

        let current = self.load_for_refresh(shop_id).await?;
        if waited && before.as_ref() != Some(&current) {
            debug!(shop_id, "Token rotated while waiting, reusing it");
            return Ok(current);
        }

        self.refresh_locked(current).await
    }

    /// Scheduler entry point: never waits for the shop's section.
    pub async fn try_refresh(&self, shop_id: i64, threshold_minutes: i64) -> Result<RefreshAttempt> {
        let Some(_guard) = self.locks.try_acquire(shop_id).await else {
            return Ok(RefreshAttempt::InProgress);
        };

        let current = self.load_for_refresh(shop_id).await?;
        if is_valid(&current, threshold_minutes) {
            return Ok(RefreshAttempt::StillValid);
        }

        self.refresh_locked(current)
            .await
            .map(RefreshAttempt::Refreshed)
    }

    /// The stored token if it is valid, otherwise a freshly refreshed one.
    pub async fn valid_token(&self, shop_id: i64) -> Result<AccessToken> {
        match self.store.get_token(shop_id).await? {
            Some(token) if self.is_valid(&token) => Ok(token),
            Some(_) => self.refresh(shop_id).await,
            None => Err(ServiceError::NotFound(format!("credential for shop {shop_id}"))),
        }
    }

    #[cfg(test)]
    pub(crate) fn locks_for_test(&self) -> &ShopLocks {
        &self.locks
    }

    async fn load_for_refresh(&self, shop_id: i64) -> Result<AccessToken> {
        self.store
            .get_token(shop_id)
            .await
            .and_then(|t| {
                t.ok_or_else(|| ServiceError::NotFound(format!("credential for shop {shop_id}")))
            })
            .map_err(|e| ServiceError::refresh(shop_id, e))
    }

    /// Exchange and store. Caller holds the shop's section.
    async fn refresh_locked(&self, current: AccessToken) -> Result<AccessToken> {
        let shop_id = current.shop_id;
        match self.exchange_and_replace(&current).await {
            Ok(token) => {
                info!(shop_id, expired_at = ?token.expired_at, "Shop token refreshed");
                self.events
                    .emit(CredentialEvent::new(
                        shop_id,
                        EventKind::Refreshed,
                        json!({
                            "expired_at": token.expired_at,
                            "request_id": token.request_id,
                        }),
                    ))
                    .await;
                Ok(token)
            }
            Err(e) => {
                let err = ServiceError::refresh(shop_id, e);
                warn!(shop_id, retryable = err.is_retryable(), "{err}");
                self.events
                    .emit(CredentialEvent::new(
                        shop_id,
                        EventKind::RefreshFailed,
                        json!({
                            "error": err.root().to_string(),
                            "code": err.code(),
                            "retryable": err.is_retryable(),
                        }),
                    ))
                    .await;
                Err(err)
            }
        }
    }

    async fn exchange_and_replace(&self, current: &AccessToken) -> Result<AccessToken> {
        let shop_id = current.shop_id;
        let issued_at = Utc::now();

        let next = self
            .gateway
            .exchange_refresh_token(&current.refresh_token, Some(shop_id), current.merchant_id)
            .await?
            .into_access_token(
                issued_at,
                ShopContext {
                    shop_id: Some(shop_id),
                    merchant_id: current.merchant_id,
                },
            )?;

        if next.shop_id != shop_id {
            return Err(ServiceError::Internal(format!(
                "gateway returned a token for shop {} while refreshing shop {shop_id}",
                next.shop_id
            )));
        }

        match self.store.replace_token(current, &next).await? {
            ReplaceOutcome::Replaced => Ok(next),
            ReplaceOutcome::Superseded(stored) => {
                warn!(shop_id, "Token was rotated by another process, keeping the stored one");
                Ok(stored)
            }
            ReplaceOutcome::Missing => Err(ServiceError::NotFound(format!(
                "credential for shop {shop_id} (disconnected during refresh)"
            ))),
        }
    }
}
