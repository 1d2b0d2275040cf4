//! CourseBridge API Server
//!
//! Receives Medusa `order.paid` webhooks and queues Moodle enrollment work.

use coursebridge_api::{create_router, AppState, Config};
use coursebridge_enrollment::IntakeService;
use coursebridge_shared::{connect_store, create_migration_pool, create_pool, run_migrations};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing (LOG_FORMAT=json for structured output)
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,coursebridge_api=debug".into()),
    );
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting CourseBridge API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    tracing::info!("Running database migrations...");
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    let store = connect_store(config.redis_url.as_deref()).await?;
    let intake = IntakeService::from_pool(pool, store);
    tracing::info!("Webhook intake initialized");

    let addr = config.bind_address;
    let state = AppState::new(config, intake);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
