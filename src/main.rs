//! Expense approval service binary.
//!
//! ```bash
//! expense-approval --config config.toml
//! expense-approval --db /tmp/expenses.db --bind 0.0.0.0:8080
//! ```
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use expense_approval::api::{self, AppState};
use expense_approval::config::{Config, LogFormat};
use expense_approval::service::ExpenseService;

#[derive(Debug, Parser)]
#[command(name = "expense-approval", version, about = "Expense approval routing service")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `[database] path`
    #[arg(long)]
    db: Option<PathBuf>,

    /// Overrides `[server] bind`
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    init_logging(&config);

    let service = ExpenseService::open(&config.database.path)
        .with_context(|| format!("opening database at {}", config.database.path.display()))?;
    if !config.directory.is_empty() {
        config.directory.apply(&service)?;
    }

    let state = AppState::new(service);
    let app = api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!(addr = %config.server.bind, db = %config.database.path.display(), "expense approval service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.service.flush()?;
    info!("shut down cleanly");
    Ok(())
}

fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init(),
        LogFormat::Text => tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
    }
}
