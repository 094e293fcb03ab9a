//! Raffle oracle and keeper backend.
//!
//! Off-chain service that drives the raffle's draw cycle. Runs up to four
//! concurrent subsystems:
//!
//! - **Listener**: WebSocket subscription to coordinator events plus a startup
//!   catch-up scan for pending requests.
//! - **Fulfiller**: signs randomness for each request and submits the
//!   coordinator fulfillment, which calls back into the raffle.
//! - **Keeper**: polls the raffle and sends `perform_upkeep` when a draw is due.
//! - **HTTP server**: `/health`, `/status` and `/metrics`.

use actix_web::{web, App, HttpResponse, HttpServer};
use serde::Serialize;
use solana_sdk::signature::Signer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod anchor;
mod config;
mod fulfiller;
mod keeper;
mod listener;
mod metrics;
mod raffle_accounts;
mod transaction;
mod vrf;

use config::AppConfig;
use metrics::Metrics;

/// Shared application state accessible from HTTP handlers.
struct AppState {
    /// Number of fulfillment transactions currently in-flight.
    pending_count: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
    raffle: String,
    fulfiller_enabled: bool,
    keeper_enabled: bool,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    status: &'static str,
    raffle: &'a str,
    fulfiller_enabled: bool,
    keeper_enabled: bool,
    pending_fulfillments: u64,
    last_keeper_poll_unix: i64,
}

/// Liveness probe: 200 while the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse {
        status: "running",
        raffle: &data.raffle,
        fulfiller_enabled: data.fulfiller_enabled,
        keeper_enabled: data.keeper_enabled,
        pending_fulfillments: data.pending_count.load(Ordering::Relaxed),
        last_keeper_poll_unix: data.metrics.last_poll_unix.load(Ordering::Relaxed),
    })
}

async fn metrics_handler(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.metrics.to_json())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,solana_client=warn,solana_rpc_client=warn,hyper=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env()?;

    info!(
        coordinator = %config.coordinator_program_id,
        raffle = %config.raffle_program_id,
        authority = %config.authority_keypair.pubkey(),
        keeper = %config.keeper_keypair.pubkey(),
        "Starting raffle backend"
    );
    info!(rpc = %config.rpc_url, ws = %config.ws_url, "Endpoints configured");

    let pending_count = Arc::new(AtomicU64::new(0));
    let metrics = Arc::new(Metrics::new());

    if config.fulfiller_enabled {
        let (tx, rx) = mpsc::channel(256);
        let requeue = tx.downgrade();

        // Requests that arrived while the backend was offline.
        listener::catch_up_pending_requests(&config, &tx, &metrics).await;

        let listener_config = config.clone();
        let listener_metrics = metrics.clone();
        tokio::spawn(async move {
            listener::listen_for_events(listener_config, tx, listener_metrics).await;
        });

        let fulfiller_config = config.clone();
        let fulfiller_pending = pending_count.clone();
        let fulfiller_metrics = metrics.clone();
        tokio::spawn(async move {
            fulfiller::run_fulfiller(
                fulfiller_config,
                rx,
                requeue,
                fulfiller_pending,
                fulfiller_metrics,
            )
            .await;
        });
    } else {
        info!("Fulfiller disabled");
    }

    if config.keeper_enabled {
        let keeper_config = config.clone();
        let keeper_metrics = metrics.clone();
        tokio::spawn(async move {
            keeper::run_keeper(keeper_config, keeper_metrics).await;
        });
    } else {
        info!("Keeper disabled");
    }

    let state = web::Data::new(AppState {
        pending_count,
        metrics,
        raffle: config.raffle_program_id.to_string(),
        fulfiller_enabled: config.fulfiller_enabled,
        keeper_enabled: config.keeper_enabled,
    });

    let addr = ("0.0.0.0", config.http_port);
    info!(port = config.http_port, "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics_handler))
    })
    .bind(addr)?
    .run()
    .await?;

    Ok(())
}
