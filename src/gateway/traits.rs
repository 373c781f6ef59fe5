use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};
use crate::store::AccessToken;

/// Raw exchange result. Every field is optional because the gateway only
/// returns what the marketplace gave it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expire_in: Option<i64>,
    pub shop_id: Option<i64>,
    pub merchant_id: Option<i64>,
    pub request_id: Option<String>,
    /// Marketplace error code; non-empty means the exchange was rejected.
    pub error: Option<String>,
    pub message: Option<String>,
}

/// What the caller already knows about the shop, used to fill gaps in the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShopContext {
    pub shop_id: Option<i64>,
    pub merchant_id: Option<i64>,
}

impl ExchangeResponse {
    /// The marketplace rejection carried in the body, if any.
    pub fn rejection(&self) -> Option<ServiceError> {
        let code = self.error.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
        let message = self.message.as_deref().unwrap_or_default();
        Some(ServiceError::Auth(if message.is_empty() {
            code.to_string()
        } else {
            format!("{code}: {message}")
        }))
    }

    /// Normalise into a storable token.
    ///
    /// Response fields win; `context` fills `shop_id` and `merchant_id` when the
    /// response omits them. A missing `expire_in` yields a non-expiring token.
    pub fn into_access_token(
        self,
        issued_at: DateTime<Utc>,
        context: ShopContext,
    ) -> Result<AccessToken> {
        if let Some(rejection) = self.rejection() {
            return Err(rejection);
        }

        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::Auth("exchange response has no access_token".into()))?;
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::Auth("exchange response has no refresh_token".into()))?;
        let shop_id = self.shop_id.or(context.shop_id).ok_or_else(|| {
            ServiceError::InvalidRequest(
                "shop_id missing from both the exchange response and the request".into(),
            )
        })?;

        let expired_at = AccessToken::expiry_from(issued_at, self.expire_in)?;

        Ok(AccessToken {
            access_token,
            refresh_token,
            expire_in: self.expire_in.unwrap_or(0),
            expired_at,
            shop_id,
            merchant_id: self.merchant_id.or(context.merchant_id),
            request_id: self.request_id,
        })
    }
}

/// The external service that performs the marketplace token exchange.
///
/// Implementations classify failures: `Network` for anything worth retrying
/// on the next run, `Auth` when the marketplace rejected the grant, `Config`
/// when the gateway itself is not set up.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Exchange an authorization code for a token.
    async fn exchange_code(&self, code: &str, shop_id: Option<i64>) -> Result<ExchangeResponse>;

    /// Exchange a refresh token for a new token.
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        shop_id: Option<i64>,
        merchant_id: Option<i64>,
    ) -> Result<ExchangeResponse>;
}
