use std::time::Duration;

use ea_fleet_engine::api::router::create_router;
use ea_fleet_engine::config::AppConfig;
use ea_fleet_engine::engine::Engine;
use ea_fleet_engine::{db, metrics};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // rustls 0.23 needs a process-wide crypto provider before any TLS use.
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = AppConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let metrics_handle = metrics::init_metrics()?;

    let journal = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to command journal database...");
            match db::init_pool(url).await {
                Ok(pool) => {
                    tracing::info!("Command journal enabled");
                    Some(pool)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Command journal unavailable, queue is in-memory only");
                    None
                }
            }
        }
        None => {
            tracing::info!("DATABASE_URL not set, queue is in-memory only");
            None
        }
    };

    let engine = Engine::start(config, metrics_handle, journal).await?;
    let router = create_router(engine.app_state());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
