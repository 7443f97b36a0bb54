//! ZapCast Campaign Dispatch Server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use zc_config::AppConfig;
use zc_dispatch::{
    CampaignDispatcher, CampaignScheduler, ControlRegistry, DispatcherConfig, SchedulerConfig,
    SendGate,
};
use zc_gateway::{GatewayClient, ZapiClient, ZapiClientConfig};
use zc_store::{SqliteCampaignStore, SqliteMessageStore};

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    scheduler_running: bool,
    gateway_connected: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    zc_common::logging::init_logging("zc-server");

    info!("Starting ZapCast dispatch server");

    let config = AppConfig::load()?;
    info!(
        enabled = config.scheduler.enabled,
        tick_interval_ms = config.scheduler.tick_interval_ms,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&config.database.path)
                .create_if_missing(true),
        )
        .await?;

    let store = Arc::new(SqliteCampaignStore::new(pool.clone()));
    store.init_schema().await?;
    info!(path = %config.database.path, "SQLite store ready");

    let messages = Arc::new(SqliteMessageStore::new(pool));

    let gateway = Arc::new(ZapiClient::new(ZapiClientConfig {
        base_url: config.gateway.base_url.clone(),
        instance_id: config.gateway.instance_id.clone(),
        token: config.gateway.token.clone(),
        client_token: config.gateway.client_token.clone(),
        connect_timeout: Duration::from_millis(config.gateway.connect_timeout_ms),
        request_timeout: Duration::from_millis(config.gateway.request_timeout_ms),
    })?);

    let gate = Arc::new(SendGate::new(Duration::from_millis(
        config.dispatcher.global_min_gap_ms,
    )));
    let controls = Arc::new(ControlRegistry::new());
    let worker_id = format!("zapcast-{}", uuid::Uuid::new_v4());
    let lock_lease = Duration::from_secs(config.scheduler.lock_lease_seconds);

    let dispatcher = Arc::new(CampaignDispatcher::new(
        DispatcherConfig {
            max_attempts: config.dispatcher.max_attempts,
            retry_backoff: Duration::from_millis(config.dispatcher.retry_backoff_ms),
            lock_lease,
        },
        store.clone(),
        messages,
        gateway.clone(),
        gate,
        worker_id,
    ));

    let scheduler = Arc::new(CampaignScheduler::new(
        SchedulerConfig {
            enabled: config.scheduler.enabled,
            tick_interval: Duration::from_millis(config.scheduler.tick_interval_ms),
            batch_size: config.scheduler.batch_size,
            lock_lease,
        },
        store,
        dispatcher,
        controls,
    ));
    scheduler.start();

    let health_scheduler = scheduler.clone();
    let health_gateway = gateway.clone();
    let app = Router::new()
        .route(
            "/q/health",
            get(move || {
                let scheduler = health_scheduler.clone();
                let gateway = health_gateway.clone();
                async move {
                    let scheduler_running = scheduler.is_running();
                    let gateway_connected = gateway
                        .get_instance_status()
                        .await
                        .map(|s| s.connected)
                        .unwrap_or(false);
                    let status = if scheduler_running { "UP" } else { "DOWN" };
                    Json(HealthResponse {
                        status: status.to_string(),
                        scheduler_running,
                        gateway_connected,
                    })
                }
            }),
        )
        .route(
            "/q/health/live",
            get(|| async { Json(serde_json::json!({"status": "UP"})) }),
        )
        .route(
            "/q/health/ready",
            get(|| async { Json(serde_json::json!({"status": "UP"})) }),
        );

    let addr = SocketAddr::new(config.http.host.parse()?, config.http.port);
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    info!("ZapCast server stopped");
    Ok(())
}

async fn shutdown_signal(scheduler: Arc<CampaignScheduler>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
    scheduler.stop();
}
