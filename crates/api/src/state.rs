//! Application state

use std::sync::Arc;

use larder_billing::{EngineConfig, EntitlementEngine};
use sqlx::PgPool;

use crate::{auth::JwtManager, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Reconciliation engine and every service built on it
    pub engine: Arc<EntitlementEngine>,
    /// Absent only in tests that run against in-memory ports
    pub pool: Option<PgPool>,
}

impl AppState {
    /// Postgres-backed state for the server binary
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.supabase_jwt_secret);

        let engine = EntitlementEngine::postgres(
            pool.clone(),
            Arc::new(jwt_manager),
            EngineConfig {
                aggregator_webhook_secret: config.revenuecat_webhook_secret.clone(),
                stripe_webhook_secret: config.stripe_webhook_secret.clone(),
                enable_billing: config.enable_billing,
            },
        );

        Self {
            config,
            engine: Arc::new(engine),
            pool: Some(pool),
        }
    }

    /// State around an already-built engine, without a database
    pub fn with_engine(config: Config, engine: EntitlementEngine) -> Self {
        Self {
            config,
            engine: Arc::new(engine),
            pool: None,
        }
    }
}
