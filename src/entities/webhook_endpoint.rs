use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Merchant-owned webhook destination. The secret is a narrow capability:
/// it is returned exactly once at creation or rotation and never serialized
/// into list/read responses (enforced in the handler DTOs).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_endpoints")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Uuid")]
    pub id: Uuid,

    #[sea_orm(column_type = "Uuid")]
    pub store_id: Uuid,

    pub url: String,

    pub secret: String,

    /// Subscribed event types as a JSON array of strings.
    pub event_types: Json,

    pub active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::webhook_delivery::Entity")]
    Deliveries,
}

impl Related<super::webhook_delivery::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Deliveries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn subscribed_to(&self, event_type: &str) -> bool {
        self.event_types
            .as_array()
            .map(|types| types.iter().any(|t| t.as_str() == Some(event_type)))
            .unwrap_or(false)
    }
}
