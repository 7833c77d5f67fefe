//! Document store backed by PostgreSQL
//!
//! Connection pooling, schema migrations and the [`PgDocumentStore`] sink.

pub mod document_store;
pub mod pool;

// Re-export commonly used types
pub use document_store::{PgDocumentStore, StoreError, StoredDocument};
pub use pool::{create_pool, DbPool};

use sqlx::migrate::Migrator;

/// Database migrator for running schema migrations
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
