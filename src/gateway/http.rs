use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::traits::{AuthGateway, ExchangeResponse};
use crate::error::{Result, ServiceError};

/// Auth gateway reached over HTTP (the serverless function that signs and
/// forwards exchange calls to the marketplace).
///
/// - `POST {base}/exchange-code` with `{code, shop_id}`
/// - `POST {base}/refresh-token` with `{refresh_token, shop_id, merchant_id}`
pub struct HttpAuthGateway {
    base_url: Url,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct CodeRequest<'a> {
    code: &'a str,
    shop_id: Option<i64>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    shop_id: Option<i64>,
    merchant_id: Option<i64>,
}

impl HttpAuthGateway {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        // A trailing slash makes `join` append instead of replacing the last segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ServiceError::Config(format!("Invalid AUTH_GATEWAY_URL: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            api_key,
            http,
        })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<ExchangeResponse> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ServiceError::Config(format!("Invalid gateway path {path}: {e}")))?;
        let request_id = uuid::Uuid::new_v4().to_string();

        let mut req = self
            .http
            .post(url)
            .header("x-request-id", &request_id)
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ServiceError::Network(format!("Gateway request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ServiceError::Network(format!("Failed to read gateway response: {e}")))?;

        debug!(%status, request_id = %request_id, path, "Auth gateway responded");

        let mut parsed = classify(status, &text)?;
        parsed.request_id.get_or_insert(request_id);
        Ok(parsed)
    }
}

/// Map a gateway HTTP response onto the error taxonomy.
fn classify(status: StatusCode, body: &str) -> Result<ExchangeResponse> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ServiceError::Network(format!(
            "gateway returned {status}: {}",
            truncate(body)
        )));
    }

    let parsed: Option<ExchangeResponse> = serde_json::from_str(body).ok();

    if !status.is_success() {
        let detail = parsed
            .as_ref()
            .and_then(|p| p.rejection())
            .map(|e| e.to_string())
            .unwrap_or_else(|| truncate(body));
        return Err(ServiceError::Auth(format!("gateway returned {status}: {detail}")));
    }

    let parsed = parsed.ok_or_else(|| {
        ServiceError::Network(format!("unparseable gateway response: {}", truncate(body)))
    })?;

    match parsed.rejection() {
        Some(rejection) => Err(rejection),
        None => Ok(parsed),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    async fn exchange_code(&self, code: &str, shop_id: Option<i64>) -> Result<ExchangeResponse> {
        self.post("exchange-code", &CodeRequest { code, shop_id }).await
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        shop_id: Option<i64>,
        merchant_id: Option<i64>,
    ) -> Result<ExchangeResponse> {
        self.post(
            "refresh-token",
            &RefreshRequest {
                refresh_token,
                shop_id,
                merchant_id,
            },
        )
        .await
    }
}
