//! standctl server
//!
//! Leases stand units to requesters and runs remote commands on leased
//! devices over shell and serial lanes.

use axum::Router;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, instrument, warn};

mod config;
mod routes;
mod state;

use config::Config;
use standctl_database::{load_inventory, Database, ReservationManager};
use standctl_scheduler::{housekeeping, Dispatcher, Scheduler, Transports};
use state::{AppState, LabContext};

/// standctl server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "STANDCTL_ADDR")]
    addr: String,

    /// Path to configuration file
    #[arg(short, long, env = "STANDCTL_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
#[instrument]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server=debug".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;
    info!(addr = %args.addr, "Starting standctl server");

    // Open the database and bring the registry in line with the inventory
    let database = Database::new(&config.database_url).await?;
    database.migrate().await?;

    if config.inventory.is_empty() {
        warn!("Inventory is empty, no units can be reserved");
    }
    let summary = load_inventory(database.pool(), &config.inventory).await?;
    info!(
        groups = summary.groups,
        devices = summary.devices,
        pins = summary.pins,
        "Inventory loaded"
    );

    let reservations =
        ReservationManager::new(database.pool().clone(), config.default_reservation_ttl());

    // Start the execution lanes, then pick up work left by a previous run
    info!("Starting execution lanes");
    let dispatcher = Dispatcher::start(
        database.pool().clone(),
        config.dispatcher_config(),
        &Transports::native(),
        Arc::new(config.credential_provider()),
    );
    let recovered = dispatcher.recover().await?;
    if recovered > 0 {
        info!(recovered, "Re-queued unfinished tasks");
    }

    // Start housekeeping
    info!("Starting scheduler");
    let scheduler = Arc::new(Scheduler::new());
    housekeeping::register(
        &scheduler,
        &config.housekeeping,
        reservations.clone(),
        database.pool().clone(),
    )
    .await?;
    scheduler.start();

    let state = AppState::new(config, LabContext::new(database, reservations, dispatcher));

    // Build Axum router
    let app = Router::new()
        .nest("/api", routes::api_routes(state))
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                },
            ),
        )
        .layer(tower_http::compression::CompressionLayer::new())
        .layer(tower_http::cors::CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "Server listening");

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
