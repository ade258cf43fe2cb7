use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request/response deduplication keyed by the client-supplied idempotency
/// key (global namespace). The request hash is immutable after first use; a
/// second request with the same key but a different hash is a conflict.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "idempotency_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// SHA-256 over the canonicalized (key-sorted) request body JSON.
    pub request_hash: String,

    #[sea_orm(column_type = "Uuid")]
    pub store_id: Uuid,

    pub endpoint: String,

    /// Null until the first execution completes.
    pub response_status: Option<i32>,
    pub response_body: Option<Json>,

    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// A record with no stored response belongs to a request still executing.
    pub fn is_in_flight(&self) -> bool {
        self.response_status.is_none()
    }
}
