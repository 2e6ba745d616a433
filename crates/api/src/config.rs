//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_direct_url: Option<String>,

    // Authentication
    pub supabase_jwt_secret: String,

    // Webhooks (absent secret locks the endpoint)
    pub revenuecat_webhook_secret: Option<String>,
    pub stripe_webhook_secret: Option<String>,

    // Feature flags
    pub enable_billing: bool,
    pub run_migrations: bool,
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_direct_url: optional("DATABASE_DIRECT_URL"),

            supabase_jwt_secret: {
                let secret = env::var("SUPABASE_JWT_SECRET")
                    .map_err(|_| ConfigError::Missing("SUPABASE_JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "SUPABASE_JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            revenuecat_webhook_secret: optional("REVENUECAT_WEBHOOK_SECRET"),
            stripe_webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),

            enable_billing: flag("ENABLE_BILLING", true),
            run_migrations: flag("RUN_MIGRATIONS", false),
        })
    }

    /// Connection string for migrations, bypassing the pooler when configured
    pub fn migration_database_url(&self) -> &str {
        self.database_direct_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
