use async_trait::async_trait;
use tracing::warn;

use super::traits::{AuthGateway, ExchangeResponse};
use crate::error::{Result, ServiceError};

/// Validity given to fabricated tokens (the marketplace's usual four hours).
const OFFLINE_EXPIRE_IN: i64 = 4 * 60 * 60;

/// Fabricates tokens without calling the marketplace.
///
/// Only constructed when `OFFLINE_MODE=true`. Every fabricated token is logged
/// at warn level so it cannot silently stand in for a real exchange.
pub struct OfflineGateway;

impl OfflineGateway {
    fn fabricate(&self, shop_id: Option<i64>, merchant_id: Option<i64>) -> ExchangeResponse {
        let id = uuid::Uuid::new_v4().simple().to_string();
        warn!(?shop_id, "OFFLINE_MODE: fabricating shop token, no marketplace call made");
        ExchangeResponse {
            access_token: Some(format!("offline-at-{id}")),
            refresh_token: Some(format!("offline-rt-{id}")),
            expire_in: Some(OFFLINE_EXPIRE_IN),
            shop_id,
            merchant_id,
            request_id: Some(format!("offline-{id}")),
            error: None,
            message: None,
        }
    }
}

#[async_trait]
impl AuthGateway for OfflineGateway {
    async fn exchange_code(&self, _code: &str, shop_id: Option<i64>) -> Result<ExchangeResponse> {
        Ok(self.fabricate(shop_id, None))
    }

    async fn exchange_refresh_token(
        &self,
        _refresh_token: &str,
        shop_id: Option<i64>,
        merchant_id: Option<i64>,
    ) -> Result<ExchangeResponse> {
        Ok(self.fabricate(shop_id, merchant_id))
    }
}

/// Stand-in when no gateway is configured: every exchange fails with a
/// configuration error for the shop involved, the process keeps running.
pub struct UnconfiguredGateway;

impl UnconfiguredGateway {
    fn error() -> ServiceError {
        ServiceError::Config("AUTH_GATEWAY_URL is not configured".into())
    }
}

#[async_trait]
impl AuthGateway for UnconfiguredGateway {
    async fn exchange_code(&self, _code: &str, _shop_id: Option<i64>) -> Result<ExchangeResponse> {
        Err(Self::error())
    }

    async fn exchange_refresh_token(
        &self,
        _refresh_token: &str,
        _shop_id: Option<i64>,
        _merchant_id: Option<i64>,
    ) -> Result<ExchangeResponse> {
        Err(Self::error())
    }
}
