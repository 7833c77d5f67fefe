//! Database connection pool management for the document store

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DocumentStoreConfig;
use crate::error::{Error, Result};

/// Type alias for the database connection pool
pub type DbPool = PgPool;

/// Create a new database connection pool
///
/// Connectivity is verified before the pool is returned, so a bad URL fails
/// at startup rather than on the first order.
pub async fn create_pool(config: &DocumentStoreConfig) -> Result<DbPool> {
    // Parse connection options from URL
    let connect_options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| Error::config(format!("Invalid document store URL: {}", e)))?
        // Name the connection for pg_stat_activity
        .application_name("order-fanout")
        // Statements only show up at debug
        .log_statements(tracing::log::LevelFilter::Debug);

    // Configure pool options
    let pool = PgPoolOptions::new()
        // Pool size
        .max_connections(config.pool_max_size)
        // Timeouts
        .acquire_timeout(config.pool_timeout())
        .idle_timeout(Some(Duration::from_secs(600)))
        // Recycle long-lived connections
        .max_lifetime(Some(Duration::from_secs(3600)))
        .connect_with(connect_options)
        .await
        .map_err(|e| Error::store_write(format!("Failed to create connection pool: {}", e)))?;

    // Fail at startup, not on the first order
    health_check(&pool).await?;

    tracing::info!(
        max_connections = config.pool_max_size,
        url = %config.masked_url(),
        "Document store connection pool created"
    );

    Ok(pool)
}

/// Verify the pool can run a trivial query
pub async fn health_check(pool: &DbPool) -> Result<()> {
    let start = std::time::Instant::now();

    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| Error::store_write(format!("Health check failed: {}", e)))?;

    let elapsed = start.elapsed();
    if elapsed > Duration::from_secs(1) {
        tracing::warn!(
            elapsed_ms = elapsed.as_millis(),
            "Document store health check slow"
        );
    }

    Ok(())
}
