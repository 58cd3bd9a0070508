//! # Database
//!
//! Connection pool construction and the embedded schema migrations (`migrations/`).

use crate::config::DatabaseConfig;
use crate::error::ProcessResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Build a PostgreSQL pool from configuration, running migrations when enabled
pub async fn create_pool(config: &DatabaseConfig) -> ProcessResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database pool created"
    );

    if config.run_migrations {
        run_migrations(&pool).await?;
    }
    Ok(pool)
}

/// Apply the `processes`/`process_steps` schema
pub async fn run_migrations(pool: &PgPool) -> ProcessResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
