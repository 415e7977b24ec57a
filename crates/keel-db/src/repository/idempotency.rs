//! # Idempotency Repository
//!
//! Stores the response of every keyed mutating request so that a replay
//! with the same key and payload returns the original result.
//!
//! The row is written in the same transaction as the business effect, so
//! a stored response always describes committed state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};

use crate::error::{DbError, DbResult};

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Operation name, e.g. `order.confirm`.
    pub operation: String,
    /// Hex SHA-256 of the canonical request payload.
    pub request_hash: String,
    /// JSON of the response.
    pub response: String,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(
        key: impl Into<String>,
        operation: impl Into<String>,
        request_hash: impl Into<String>,
        response: &impl Serialize,
        now: DateTime<Utc>,
    ) -> DbResult<Self> {
        Ok(IdempotencyRecord {
            key: key.into(),
            operation: operation.into(),
            request_hash: request_hash.into(),
            response: serde_json::to_string(response)?,
            created_at: now,
        })
    }

    /// Decodes the stored response.
    pub fn response<T: for<'de> Deserialize<'de>>(&self) -> DbResult<T> {
        serde_json::from_str(&self.response)
            .map_err(|e| DbError::decode("idempotency_keys", e))
    }
}

/// Repository for idempotency records.
#[derive(Debug, Clone)]
pub struct IdempotencyRepository {
    pool: SqlitePool,
}

impl IdempotencyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        IdempotencyRepository { pool }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<IdempotencyRecord>> {
        Self::fetch(&self.pool, key).await
    }

    pub async fn fetch<'e, E: SqliteExecutor<'e>>(
        exec: E,
        key: &str,
    ) -> DbResult<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT key, operation, request_hash, response, created_at \
             FROM idempotency_keys WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(exec)
        .await?;
        Ok(record)
    }

    pub async fn insert(conn: &mut SqliteConnection, record: &IdempotencyRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, operation, request_hash, response, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&record.key)
        .bind(&record.operation)
        .bind(&record.request_hash)
        .bind(&record.response)
        .bind(record.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { .. } => DbError::duplicate("idempotency_key", &record.key),
            other => other,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_db;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        order_id: String,
        total: i64,
    }

    #[tokio::test]
    async fn test_store_and_replay() {
        let db = memory_db().await;
        let receipt = Receipt {
            order_id: "o1".into(),
            total: 11_800,
        };
        let record =
            IdempotencyRecord::new("key-1", "order.confirm", "abc123", &receipt, Utc::now())
                .unwrap();

        let mut tx = db.begin().await.unwrap();
        IdempotencyRepository::insert(&mut tx, &record).await.unwrap();
        tx.commit().await.unwrap();

        let stored = db.idempotency().get("key-1").await.unwrap().unwrap();
        assert_eq!(stored.request_hash, "abc123");
        assert_eq!(stored.response::<Receipt>().unwrap(), receipt);

        let mut tx = db.begin().await.unwrap();
        let err = IdempotencyRepository::insert(&mut tx, &record).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }
}
