mod http;
mod offline;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use http::HttpAuthGateway;
pub use offline::{OfflineGateway, UnconfiguredGateway};
pub use traits::{AuthGateway, ExchangeResponse, ShopContext};

use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;

/// Pick the gateway implementation the configuration asks for.
pub fn from_config(config: &Config) -> Result<Arc<dyn AuthGateway>> {
    if config.offline_mode {
        warn!("OFFLINE_MODE enabled: shop tokens will be fabricated, never use in production");
        return Ok(Arc::new(OfflineGateway));
    }

    match &config.gateway_url {
        Some(url) => Ok(Arc::new(HttpAuthGateway::new(
            url,
            config.gateway_key.clone(),
            config.gateway_timeout,
        )?)),
        None => {
            warn!("AUTH_GATEWAY_URL not set: authenticate and refresh will fail per shop");
            Ok(Arc::new(UnconfiguredGateway))
        }
    }
}
