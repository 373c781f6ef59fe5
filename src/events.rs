//! Credential audit events.
//!
//! Every authenticate, refresh and sync transition produces one
//! [`CredentialEvent`]. Events are always logged through `tracing` and, when a
//! sink is configured, persisted for later querying. Sink failures are logged
//! and otherwise ignored: auditing never fails the operation it describes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "token.authenticated")]
    Authenticated,
    #[serde(rename = "token.refreshed")]
    Refreshed,
    #[serde(rename = "token.refresh_failed")]
    RefreshFailed,
    #[serde(rename = "sync.started")]
    SyncStarted,
    #[serde(rename = "sync.taken_over")]
    SyncTakenOver,
    #[serde(rename = "sync.completed")]
    SyncCompleted,
    #[serde(rename = "sync.failed")]
    SyncFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Authenticated => "token.authenticated",
            EventKind::Refreshed => "token.refreshed",
            EventKind::RefreshFailed => "token.refresh_failed",
            EventKind::SyncStarted => "sync.started",
            EventKind::SyncTakenOver => "sync.taken_over",
            EventKind::SyncCompleted => "sync.completed",
            EventKind::SyncFailed => "sync.failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialEvent {
    pub shop_id: i64,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub metadata: Value,
}

impl CredentialEvent {
    pub fn new(shop_id: i64, kind: EventKind, metadata: Value) -> Self {
        Self {
            shop_id,
            kind,
            at: Utc::now(),
            metadata,
        }
    }
}

/// Durable destination for credential events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &CredentialEvent) -> Result<()>;
}

/// Emits events to the log and the optional sink.
#[derive(Clone, Default)]
pub struct EventLog {
    sink: Option<Arc<dyn EventSink>>,
}

impl EventLog {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn tracing_only() -> Self {
        Self { sink: None }
    }

    pub async fn emit(&self, event: CredentialEvent) {
        info!(
            target: "shop_credentials::events",
            event = event.kind.as_str(),
            shop_id = event.shop_id,
            metadata = %event.metadata,
            "credential event"
        );

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(&event).await {
                warn!(
                    shop_id = event.shop_id,
                    event = event.kind.as_str(),
                    "Failed to persist credential event: {e}"
                );
            }
        }
    }
}
