//! Call store selection: Postgres when a database URL is configured,
//! otherwise process memory.

use anyhow::Result;
use sessionlink_core::{
    repository::{CallStore, MemoryCallStore, PgCallStore},
    Config,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn init_call_store(config: &Config) -> Result<Arc<dyn CallStore>> {
    if !config.database.is_configured() {
        warn!("Database not configured, calls are kept in memory and lost on restart");
        return Ok(Arc::new(MemoryCallStore::new()));
    }

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_seconds))
        .connect(config.database_url())
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            anyhow::anyhow!("Database connection failed: {e}")
        })?;
    info!("Database connected successfully");

    if config.database.run_migrations {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&pool).await.map_err(|e| {
            error!("Failed to run migrations: {}", e);
            anyhow::anyhow!("Migration failed: {e}")
        })?;
        info!("Migrations completed");
    }

    Ok(Arc::new(PgCallStore::new(pool)))
}
