use std::collections::BTreeMap;
use std::sync::Arc;

use pulse_core::{install, AgentConfig};
use pulse_session::SessionManager;
use pulse_store::{Database, EventStore};
use pulse_uploader::Uploader;

/// Demo wiring: one session round against the configured collector.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = AgentConfig::default();
    if let Ok(host) = std::env::var("PULSE_COLLECTOR_HOST") {
        config.collector_host = host;
    }
    let app_key = std::env::var("PULSE_APP_KEY").unwrap_or_else(|_| "demo-app-key".to_string());

    let db_path = config.data_dir.join("pulse.db");
    let db = Database::open(&db_path)?;
    let store = Arc::new(EventStore::new(db, config.limits));
    tracing::info!(path = %db_path.display(), "event store ready");

    let install_id = install::load_or_create(&config.data_dir)?;
    let uploader = Arc::new(Uploader::new(
        config.collector_base(),
        config.upload_timeout,
    )?);

    let mut session = SessionManager::new(
        config,
        store,
        uploader,
        install_id,
        env!("CARGO_PKG_VERSION").to_string(),
    );

    session.init(&app_key);
    session.open();

    session.tag_screen("home");
    let mut attrs = BTreeMap::new();
    attrs.insert("source".to_string(), "demo".to_string());
    session.tag_event("app_started", &attrs, &BTreeMap::new());

    let outcome = session.upload().await?;
    tracing::info!(?outcome, "upload finished");

    session.close();
    tracing::info!("session closed");
    Ok(())
}
