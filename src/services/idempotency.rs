//! Idempotency-key bookkeeping for mutating endpoints.
//!
//! The flow is claim-execute-finalize: `check_or_create` claims the key by
//! inserting a record with no stored response, the handler executes the
//! operation exactly once, and `set_response` finalizes the record so later
//! requests with the same key replay the stored response.
//!
//! Finalized records are additionally kept in the fast cache, so the common
//! replay path never touches the durable store. Cache failures fall through
//! to the database.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::{self, CacheBackend},
    entities::{idempotency_record, IdempotencyRecord},
    errors::ServiceError,
};

/// What the caller should do with the current request.
#[derive(Clone, Debug)]
pub enum IdempotencyOutcome {
    /// First time this key is seen; execute the operation and finalize.
    New,
    /// The operation already completed; return the stored response as-is.
    Replay {
        status: i32,
        body: serde_json::Value,
    },
    /// Another request holding this key is still executing.
    InProgress,
}

/// Cache image of a finalized record.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct FinalizedRecord {
    request_hash: String,
    response_status: i32,
    response_body: serde_json::Value,
}

fn cache_key(key: &str) -> String {
    format!("idempotency:{}", key)
}

#[derive(Clone)]
pub struct IdempotencyService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    retention: Duration,
}

impl IdempotencyService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        retention_days: i64,
    ) -> Self {
        Self {
            db,
            cache,
            retention: Duration::days(retention_days),
        }
    }

    /// Claims `key` for this request, or classifies the request against the
    /// existing record. Reusing a key with a different request body is a
    /// conflict regardless of whether the first request finished.
    pub async fn check_or_create(
        &self,
        key: &str,
        store_id: Uuid,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<IdempotencyOutcome, ServiceError> {
        let hash = request_hash(body);
        let now = Utc::now();

        // Finalized records replay from the cache without a database read.
        match cache::get_json::<FinalizedRecord>(self.cache.as_ref(), &cache_key(key)).await {
            Ok(Some(cached)) => {
                if cached.request_hash != hash {
                    return Err(ServiceError::IdempotencyConflict);
                }
                return Ok(IdempotencyOutcome::Replay {
                    status: cached.response_status,
                    body: cached.response_body,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("idempotency cache read failed for {}: {}", key, e),
        }

        if let Some(existing) = IdempotencyRecord::find_by_id(key).one(&*self.db).await? {
            if existing.expires_at > now {
                return classify(&existing, &hash);
            }
            // Expired record still holding the key: reclaim it.
            debug!("reclaiming expired idempotency key {}", key);
            IdempotencyRecord::delete_by_id(key).exec(&*self.db).await?;
        }

        let record = idempotency_record::ActiveModel {
            key: Set(key.to_string()),
            request_hash: Set(hash.clone()),
            store_id: Set(store_id),
            endpoint: Set(endpoint.to_string()),
            response_status: Set(None),
            response_body: Set(None),
            expires_at: Set(now + self.retention),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match record.insert(&*self.db).await {
            Ok(_) => Ok(IdempotencyOutcome::New),
            Err(insert_err) => {
                // Lost an insert race on the primary key; the winner's record
                // decides how to classify this request.
                match IdempotencyRecord::find_by_id(key).one(&*self.db).await? {
                    Some(existing) => classify(&existing, &hash),
                    None => Err(ServiceError::DatabaseError(insert_err)),
                }
            }
        }
    }

    /// Finalizes a claimed key with the response that all replays will see.
    pub async fn set_response(
        &self,
        key: &str,
        status: i32,
        body: serde_json::Value,
    ) -> Result<(), ServiceError> {
        let record = IdempotencyRecord::find_by_id(key)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("idempotency key {} not found", key)))?;

        let now = Utc::now();
        let expires_at = record.expires_at;
        let mut active: idempotency_record::ActiveModel = record.into();
        active.response_status = Set(Some(status));
        active.response_body = Set(Some(body.clone()));
        active.updated_at = Set(now);
        let updated = active.update(&*self.db).await?;

        // Mirror into the fast cache for the remainder of the retention
        // window. Best-effort: a miss falls back to the record.
        let ttl = (expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let cached = FinalizedRecord {
            request_hash: updated.request_hash,
            response_status: status,
            response_body: body,
        };
        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &cache_key(key), &cached, Some(ttl)).await
        {
            warn!("idempotency cache write failed for {}: {}", key, e);
        }
        Ok(())
    }

    /// Releases a claimed key after the operation failed before producing a
    /// replayable response, so the client may retry with the same key.
    pub async fn release(&self, key: &str) {
        if let Err(e) = IdempotencyRecord::delete_by_id(key).exec(&*self.db).await {
            warn!("failed to release idempotency key {}: {}", key, e);
        }
        let _ = self.cache.delete(&cache_key(key)).await;
    }

    /// Deletes records past their retention window. Run periodically.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let result = IdempotencyRecord::delete_many()
            .filter(idempotency_record::Column::ExpiresAt.lte(now))
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            info!("removed {} expired idempotency records", result.rows_affected);
        }
        Ok(result.rows_affected)
    }
}

fn classify(
    existing: &idempotency_record::Model,
    hash: &str,
) -> Result<IdempotencyOutcome, ServiceError> {
    if existing.request_hash != hash {
        return Err(ServiceError::IdempotencyConflict);
    }
    if existing.is_in_flight() {
        return Ok(IdempotencyOutcome::InProgress);
    }
    Ok(IdempotencyOutcome::Replay {
        status: existing.response_status.unwrap_or(200),
        body: existing
            .response_body
            .clone()
            .unwrap_or(serde_json::Value::Null),
    })
}

/// SHA-256 over the canonical (recursively key-sorted) JSON encoding, so
/// semantically identical bodies hash identically regardless of key order.
pub fn request_hash(body: &serde_json::Value) -> String {
    let canonical = canonicalize(body);
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}
