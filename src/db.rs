use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

/// Create a new connection pool from the database section of the config
///
/// sqlx pools are reference-counted; clone the returned pool to share it.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .context("database.url must be set for the postgres backend")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> PgPool {
    let config = DatabaseConfig {
        url: Some(
            std::env::var("TEMPO_DATABASE_URL")
                .expect("TEMPO_DATABASE_URL must be set for database tests"),
        ),
        ..DatabaseConfig::default()
    };
    let pool = create_pool(&config).await.unwrap();
    migrate(&pool).await.unwrap();
    pool
}
