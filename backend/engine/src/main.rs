//! ChainFund funding engine — entry point.
//!
//! Runs the campaign lifecycle service: REST API for campaign, funding,
//! proof, voting, and release operations; a background sweeper applying
//! deadline policy; and a gateway that invokes the deployed Soroban
//! contracts through the stellar CLI.

mod api;
mod config;
mod db;
mod engine;
mod errors;
mod gateway;
mod notify;
mod oracle;
mod sweeper;
mod types;
mod voting;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use engine::Engine;
use gateway::{CliGateway, ContractGateway};
use notify::Notifier;
use oracle::{HeuristicOracle, ProofOracle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let cfg = Arc::new(Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?);

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&cfg.database_url).await?;

    let gateway: Arc<dyn ContractGateway> = Arc::new(CliGateway::from_config(&cfg));
    let oracle: Arc<dyn ProofOracle> = Arc::new(HeuristicOracle);
    let notifier = Notifier::new(cfg.webhook_url.clone())?;

    let engine = Engine {
        pool,
        cfg: cfg.clone(),
        gateway,
        oracle,
        notifier,
    };

    // ─── Background sweeper ───────────────────────────────
    let shutdown = CancellationToken::new();
    tokio::spawn(sweeper::run(engine.clone(), shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(engine)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", cfg.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
