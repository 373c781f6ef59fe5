//! Scripted gateway for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{AuthGateway, ExchangeResponse};
use crate::error::{Result, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    RejectGrant,
    Unreachable,
}

#[derive(Default)]
pub struct ScriptedGateway {
    behaviors: Mutex<HashMap<i64, Behavior>>,
    delay: Option<Duration>,
    omit_shop_id: bool,
    serial: AtomicUsize,
    refresh_calls: Mutex<HashMap<i64, usize>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn omitting_shop_id(mut self) -> Self {
        self.omit_shop_id = true;
        self
    }

    pub fn set(&self, shop_id: i64, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(shop_id, behavior);
    }

    pub fn refresh_calls(&self, shop_id: i64) -> usize {
        self.refresh_calls
            .lock()
            .unwrap()
            .get(&shop_id)
            .copied()
            .unwrap_or(0)
    }

    async fn respond(&self, shop_id: Option<i64>) -> Result<ExchangeResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = shop_id
            .and_then(|id| self.behaviors.lock().unwrap().get(&id).copied())
            .unwrap_or(Behavior::Succeed);
        let n = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let shop = shop_id.unwrap_or_default();

        match behavior {
            Behavior::Succeed => Ok(ExchangeResponse {
                access_token: Some(format!("at-{shop}-{n}")),
                refresh_token: Some(format!("rt-{shop}-{n}")),
                expire_in: Some(14_400),
                shop_id: if self.omit_shop_id { None } else { shop_id },
                request_id: Some(format!("req-{n}")),
                ..Default::default()
            }),
            Behavior::RejectGrant => Err(ServiceError::Auth("error_auth: invalid refresh_token".into())),
            Behavior::Unreachable => Err(ServiceError::Network("connect timeout".into())),
        }
    }
}

#[async_trait]
impl AuthGateway for ScriptedGateway {
    async fn exchange_code(&self, _code: &str, shop_id: Option<i64>) -> Result<ExchangeResponse> {
        self.respond(shop_id).await
    }

    async fn exchange_refresh_token(
        &self,
        _refresh_token: &str,
        shop_id: Option<i64>,
        _merchant_id: Option<i64>,
    ) -> Result<ExchangeResponse> {
        if let Some(id) = shop_id {
            *self.refresh_calls.lock().unwrap().entry(id).or_default() += 1;
        }
        self.respond(shop_id).await
    }
}
