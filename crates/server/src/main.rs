// Batchrun server
// Decision: The server wakes itself over HTTP so every run starts on a fresh request

use std::sync::Arc;

use anyhow::{Context, Result};
use batchrun_engine::{
    BackgroundProcess, HttpWakeTransport, InMemoryStore, IntervalHealthCheck, KeyValueStore,
    PostgresStore, ProcessHostLimits, WakeNonce,
};
use batchrun_server::countdown::countdown_handler;
use batchrun_server::telemetry::{init_telemetry, TelemetryConfig};
use batchrun_server::{routes, AppState, ServerConfig};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(&TelemetryConfig::from_env());

    let config = ServerConfig::from_env().context("Failed to load server configuration")?;
    let name = config.process.name();

    tracing::info!(process = %name, "Starting batchrun server");

    let store: Arc<dyn KeyValueStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("Failed to connect to database")?;
            let store = PostgresStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("Failed to create store table")?;
            tracing::info!("Using PostgreSQL store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, queue state will not survive a restart");
            Arc::new(InMemoryStore::new())
        }
    };

    let nonces = WakeNonce::new(config.wake_secret.clone());
    let transport = Arc::new(
        HttpWakeTransport::new(&config.public_url, nonces.clone())
            .context("Failed to build wake-up client")?,
    );
    let health_check = Arc::new(IntervalHealthCheck::new(
        name.clone(),
        config.process.health_check_interval,
        transport.clone(),
    ));

    let process = Arc::new(
        BackgroundProcess::new(config.process.clone(), store, Arc::new(countdown_handler()))
            .context("Invalid process configuration")?
            .with_transport(transport)
            .with_health_check(health_check)
            .with_host_limits(Arc::new(ProcessHostLimits::new(config.host_time_limit))),
    );

    let app = routes(AppState::new(process.clone(), nonces)).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, public_url = %config.public_url, "Listening");

    // Resume a queue left behind by a previous instance once we can receive the wake-up
    tokio::spawn(async move {
        match process.touch(false).await {
            Ok(true) => tracing::info!("Resumed pending queue"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to resume pending queue"),
        }
    });

    axum::serve(listener, app).await?;

    Ok(())
}
