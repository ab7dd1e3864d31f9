use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use warelay::engine::sim::SimEngine;
use warelay::{server, Database, RelayConfig, SessionManager};

#[derive(Parser)]
#[command(name = "warelay", version, about = "WhatsApp relay session manager")]
struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,

    /// SQLite database file.
    #[arg(long, default_value = "data/warelay.db")]
    database: PathBuf,

    /// Credential scope inside the database.
    #[arg(long, default_value = "default")]
    session_id: String,

    /// Exact origin allowed by CORS; omit for a permissive policy.
    #[arg(long)]
    frontend_origin: Option<String>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RelayConfig::default()
        .with_bind_addr(cli.bind)
        .with_database_path(cli.database)
        .with_session_id(cli.session_id);
    if let Some(origin) = cli.frontend_origin {
        config = config.with_frontend_origin(origin);
    }

    let db = Database::open(&config.database_path)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    // The wire-protocol binding is pluggable; the simulated engine stands in
    // until a real one is wired up.
    let engine = Arc::new(SimEngine::new());
    let session = SessionManager::new(engine, db, config.session_id.clone());

    server::serve(&config, session).await
}
