// Market draft server entry point.
//
// Startup sequence:
// 1. Initialize tracing (append to logs/market-draft.log)
// 2. Seed config/draft.toml from defaults/ if needed, then load it
// 3. Open database
// 4. Build hub, selection registry, and draft coordinator
// 5. Spawn WebSocket server task
// 6. Wait for Ctrl+C, then cancel running drafts and stop the server

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use market_draft::app::App;
use market_draft::config;
use market_draft::db::Database;
use market_draft::draft::coordinator::DraftCoordinator;
use market_draft::draft::registry::SelectionChannelRegistry;
use market_draft::hub::SubscriptionHub;
use market_draft::store::Collaborators;
use market_draft::ws_server;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_path = init_tracing()?;
    info!("Market draft server starting up, logging to {}", log_path.display());

    let config = config::load_config().context("failed to load configuration")?;
    let settings = config.draft_settings();
    info!(
        "Config loaded: {}s turns, {} picks per player",
        config.draft.turn_seconds, config.draft.picks_per_player
    );

    let db = Database::open(&config.database.path).context("failed to open database")?;
    info!("Database opened at {}", config.database.path);

    let coordinator = DraftCoordinator::new(
        Arc::new(SelectionChannelRegistry::new()),
        Arc::new(SubscriptionHub::new()),
        Collaborators::shared(Arc::new(db)),
        settings,
    );
    let app = App::new(coordinator);

    let host = config.websocket.host.clone();
    let port = config.websocket.port;
    let server_app = app.clone();
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(&host, port, server_app).await {
            error!("WebSocket server error: {}", e);
        }
    });
    info!(
        "Server ready on {}:{}",
        config.websocket.host, config.websocket.port
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    ws_handle.abort();
    app.shutdown();

    // Give cancelled draft loops a moment to release their channels.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while !app.coordinator().active_drafts().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    info!("Market draft server shut down cleanly");
    Ok(())
}

const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "market-draft.log";
const DEFAULT_LOG_FILTER: &str = "market_draft=info,warn";

/// Append structured logs to `logs/market-draft.log`. `RUST_LOG` overrides
/// the default filter.
fn init_tracing() -> anyhow::Result<PathBuf> {
    let log_dir = std::env::current_dir()?.join(LOG_DIR);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join(LOG_FILE);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(log_path)
}
