// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Larder API Server
//!
//! Receives provider webhooks and serves the subscription endpoints of the
//! reconciliation engine.

use std::net::SocketAddr;

use larder_api::{create_router, AppState, Config};
use larder_shared::{create_migration_pool, create_pool};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,larder_api=debug,larder_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Larder API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        billing_enabled = config.enable_billing,
        revenuecat_webhook = config.revenuecat_webhook_secret.is_some(),
        stripe_webhook = config.stripe_webhook_secret.is_some(),
        "Configuration loaded"
    );

    // Create database pool (using pooler URL for regular queries)
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Run migrations using direct URL (bypasses PgBouncer which doesn't support prepared statements)
    if config.run_migrations {
        tracing::info!("Running database migrations...");
        let migration_pool = create_migration_pool(config.migration_database_url()).await?;
        larder_shared::run_migrations(&migration_pool).await?;
        migration_pool.close().await;
        tracing::info!("Database migrations complete");
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(pool, config);
    let app = create_router(state);

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
