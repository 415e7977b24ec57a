//! Stored responses for keyed order requests.
//!
//! A request is identified by its operation, the order it targets and a
//! SHA-256 over its canonical JSON payload. The stored response is written
//! in the same transaction as the order change.

use chrono::{DateTime, Utc};
use keel_db::{Database, IdempotencyRecord, IdempotencyRepository};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Hex SHA-256 of `operation`, `target` and the payload.
pub(crate) fn request_hash(
    operation: &str,
    target: &str,
    payload: &impl Serialize,
) -> EngineResult<String> {
    let body = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0]);
    hasher.update(target.as_bytes());
    hasher.update([0]);
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

/// One keyed request: what it is and how to recognise a replay.
#[derive(Debug, Clone)]
pub(crate) struct Keyed {
    pub key: String,
    pub operation: String,
    pub hash: String,
}

impl Keyed {
    /// `None` when the caller sent no key.
    pub(crate) fn new(
        key: Option<&str>,
        operation: &str,
        target: &str,
        payload: &impl Serialize,
    ) -> EngineResult<Option<Keyed>> {
        let Some(key) = key else {
            return Ok(None);
        };
        Ok(Some(Keyed {
            key: key.to_string(),
            operation: operation.to_string(),
            hash: request_hash(operation, target, payload)?,
        }))
    }

    /// The response stored for this request, if it already ran.
    ///
    /// Called with the idempotency lock held and no transaction open.
    pub(crate) async fn recall<T: DeserializeOwned>(&self, db: &Database) -> EngineResult<Option<T>> {
        let Some(record) = db.idempotency().get(&self.key).await? else {
            return Ok(None);
        };
        if record.operation != self.operation || record.request_hash != self.hash {
            return Err(EngineError::IdempotencyMismatch {
                key: self.key.clone(),
            });
        }
        debug!(idempotency_key = %self.key, operation = %self.operation, "Replaying order request");
        Ok(Some(record.response()?))
    }

    /// Stores `response` inside the caller's transaction.
    pub(crate) async fn remember(
        &self,
        conn: &mut SqliteConnection,
        response: &impl Serialize,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let record = IdempotencyRecord::new(&self.key, &self.operation, &self.hash, response, now)?;
        IdempotencyRepository::insert(conn, &record).await?;
        Ok(())
    }
}
