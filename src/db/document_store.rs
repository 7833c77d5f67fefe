//! PostgreSQL implementation of the document sink
//!
//! Each order event becomes one JSONB document in `order_documents`, filed
//! under a logical database and collection name. Documents are only ever
//! appended.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

use super::DbPool;
use crate::config::DocumentStoreConfig;
use crate::error::Result;
use crate::logging::Timer;
use crate::models::OrderEvent;
use crate::sinks::DocumentSink;

/// Document store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Generic database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored document could not be read back
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convert store errors to application errors
impl From<StoreError> for crate::error::Error {
    fn from(err: StoreError) -> Self {
        crate::error::Error::store_write(err.to_string())
    }
}

/// A document as stored
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: Uuid,
    pub database_name: String,
    pub collection_name: String,
    pub body: OrderEvent,
    pub created_at: DateTime<Utc>,
}

/// Append-only document collection backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: DbPool,
    database: String,
    collection: String,
}

impl PgDocumentStore {
    /// Create a store writing to the given database/collection
    pub fn new(pool: DbPool, database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Create a store from configuration
    pub fn from_config(pool: DbPool, config: &DocumentStoreConfig) -> Self {
        Self::new(pool, config.database.clone(), config.collection.clone())
    }

    /// Insert one document, returning its generated id
    pub async fn insert(&self, event: &OrderEvent) -> std::result::Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO order_documents (id, database_name, collection_name, order_id, body)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&self.database)
        .bind(&self.collection)
        .bind(event.order_id)
        .bind(Json(event))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// All documents in this collection for an order
    pub async fn find_by_order_id(
        &self,
        order_id: Uuid,
    ) -> std::result::Result<Vec<StoredDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, database_name, collection_name, body, created_at
            FROM order_documents
            WHERE database_name = $1 AND collection_name = $2 AND order_id = $3
            ORDER BY created_at
            "#,
        )
        .bind(&self.database)
        .bind(&self.collection)
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_document).collect()
    }

    /// Number of documents in this collection
    pub async fn count(&self) -> std::result::Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM order_documents WHERE database_name = $1 AND collection_name = $2",
        )
        .bind(&self.database)
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    fn row_to_document(row: &sqlx::postgres::PgRow) -> std::result::Result<StoredDocument, StoreError> {
        let body: Json<OrderEvent> = row
            .try_get("body")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(StoredDocument {
            id: row.try_get("id")?,
            database_name: row.try_get("database_name")?,
            collection_name: row.try_get("collection_name")?,
            body: body.0,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl DocumentSink for PgDocumentStore {
    async fn add_document(&self, event: &OrderEvent) -> Result<()> {
        let timer = Timer::start("document_store_insert");

        let document_id = self.insert(event).await.map_err(|e| {
            tracing::error!(order_id = %event.order_id, error = %e, "Document store write failed");
            e
        })?;

        let duration = timer.stop();
        tracing::info!(
            order_id = %event.order_id,
            document_id = %document_id,
            collection = %self.collection,
            duration_ms = duration.as_millis(),
            "Stored order document"
        );
        Ok(())
    }
}
