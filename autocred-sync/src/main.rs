//! autocred-sync - Stage/tag synchronization service
//!
//! Keeps lead pipeline stages in the AutoCred CRM consistent with tag state
//! on the external messaging platform, so platform-side automations fire
//! correctly. Runs the HTTP trigger surface plus the backlog retry worker.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use autocred_sync::config::SyncSettings;
use autocred_sync::platform::{PlatformClient, RateLimiter};
use autocred_sync::sync::{BacklogProcessor, ReconciliationEngine};
use autocred_sync::tags::TagDirectory;
use autocred_sync::AppState;

#[derive(Debug, Parser)]
#[command(name = "autocred-sync", about = "AutoCred stage/tag synchronization service")]
struct Args {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the SQLite database (overrides config)
    #[arg(long)]
    database: Option<String>,

    /// HTTP listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting autocred-sync");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let toml_config = autocred_common::config::load_config(args.config.as_deref())?;
    let settings = SyncSettings::resolve(&toml_config, args.database.as_deref(), args.port)?;
    info!("Database: {}", settings.database.display());

    let db_pool = autocred_sync::db::init_database_pool(&settings.database).await?;
    info!("Database connection established");

    let directory = TagDirectory::load(&db_pool).await?;
    directory.verify(&settings.expected_tags);

    let rate_limiter = Arc::new(RateLimiter::new(settings.platform.rate_limit));
    let platform = PlatformClient::new(
        &settings.platform.base_url,
        &settings.platform.api_token,
        rate_limiter,
        settings.platform.max_attempts,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create platform client: {}", e))?;

    let engine = Arc::new(ReconciliationEngine::new(
        platform,
        directory,
        db_pool.clone(),
        settings.platform.settle_delay,
        settings.backlog.max_retry,
    ));

    let backlog = BacklogProcessor::new(db_pool.clone(), engine.clone(), settings.backlog.clone());
    tokio::spawn(async move { backlog.run().await });

    let state = AppState::new(db_pool, engine);
    let app = autocred_sync::build_router(state);

    let addr = format!("0.0.0.0:{}", settings.port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
