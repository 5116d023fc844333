use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vg_hub::config::HubConfig;
use vg_hub::connectors::registry::Discovery;
use vg_hub::AppState;
use vg_store::SqliteStore;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "vg-hub", version, about = "VIGIL activity log hub")]
struct Args {
    /// Path to config file
    #[arg(long, default_value = "vigil.toml")]
    config: PathBuf,

    /// Server bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path (overrides the config file)
    #[arg(long)]
    database: Option<PathBuf>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vg_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Args::parse()).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = HubConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let db_path = args
        .database
        .unwrap_or_else(|| PathBuf::from(&config.storage.path));

    let store = Arc::new(SqliteStore::open(&db_path)?);
    if config.storage.retention_days > 0 {
        store.purge_older_than(config.storage.retention_days, Utc::now())?;
    }

    let (state, report) = AppState::new(config, store, &Discovery::builtin());
    for (slug, reason) in &report.skipped {
        tracing::warn!("Connector '{}' skipped: {}", slug, reason);
    }

    let addr: SocketAddr = state.config.server.bind.parse()?;
    let app = vg_hub::router(Arc::new(state));

    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  VIGIL v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  API:        http://{}/api/records/query", addr);
    tracing::info!("  Database:   {}", db_path.display());
    tracing::info!("  Connectors: {}", report.registered.join(", "));
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
