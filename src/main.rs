use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use shop_credentials::crypto::CryptoEngine;
use shop_credentials::events::{EventLog, EventSink};
use shop_credentials::lifecycle::refresh_daemon;
use shop_credentials::store::{MemoryStore, PgStore, SyncStatusStore, TokenStore};
use shop_credentials::{api, gateway, AppState, Config, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shop_credentials=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("shop-credentials v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.host, config.port);

    let crypto = Arc::new(CryptoEngine::new(&config.master_key, &config.hmac_secret)?);

    let (tokens, sync, sink): (Arc<dyn TokenStore>, Arc<dyn SyncStatusStore>, Arc<dyn EventSink>) =
        match &config.database_url {
            Some(url) => {
                let store = Arc::new(PgStore::new(url, crypto.clone()).await?);
                store.migrate().await?;
                info!("Database connected and migrated");
                let tokens: Arc<dyn TokenStore> = store.clone();
                let sync: Arc<dyn SyncStatusStore> = store.clone();
                let sink: Arc<dyn EventSink> = store;
                (tokens, sync, sink)
            }
            None => {
                warn!("DATABASE_URL not set: credentials are kept in memory and lost on restart");
                let store = Arc::new(MemoryStore::new());
                let tokens: Arc<dyn TokenStore> = store.clone();
                let sync: Arc<dyn SyncStatusStore> = store.clone();
                let sink: Arc<dyn EventSink> = store;
                (tokens, sync, sink)
            }
        };

    let gateway = gateway::from_config(&config)?;

    let state: SharedState = Arc::new(AppState::assemble(
        config.clone(),
        crypto,
        tokens,
        sync,
        gateway,
        EventLog::new(sink),
    ));

    if config.refresh.daemon_enabled {
        tokio::spawn(refresh_daemon(state.scheduler.clone()));
    } else {
        info!("Refresh daemon disabled; relying on the cron trigger");
    }

    let app = api::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready");
    axum::serve(listener, app).await?;

    Ok(())
}
