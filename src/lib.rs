pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod store;
pub mod sync_status;

pub use config::Config;
pub use error::ServiceError;

use std::sync::Arc;

use crypto::CryptoEngine;
use events::EventLog;
use gateway::AuthGateway;
use lifecycle::{RefreshScheduler, TokenLifecycleManager};
use store::{SyncStatusStore, TokenStore};
use sync_status::SyncStatusTracker;

/// Shared application state passed to all API handlers.
pub struct AppState {
    pub config: Config,
    pub crypto: Arc<CryptoEngine>,
    pub tokens: Arc<TokenLifecycleManager>,
    pub scheduler: Arc<RefreshScheduler>,
    pub sync: SyncStatusTracker,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the lifecycle components over the given stores and gateway.
    pub fn assemble(
        config: Config,
        crypto: Arc<CryptoEngine>,
        token_store: Arc<dyn TokenStore>,
        sync_store: Arc<dyn SyncStatusStore>,
        gateway: Arc<dyn AuthGateway>,
        events: EventLog,
    ) -> Self {
        let tokens = Arc::new(
            TokenLifecycleManager::new(token_store, gateway, events.clone())
                .with_buffer_minutes(config.refresh.buffer_minutes),
        );
        let scheduler = Arc::new(RefreshScheduler::new(tokens.clone(), config.refresh.clone()));
        let sync = SyncStatusTracker::new(sync_store, events).with_stale_after(config.sync_stale_after);

        Self {
            config,
            crypto,
            tokens,
            scheduler,
            sync,
        }
    }
}
