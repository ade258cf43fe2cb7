use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ledger transaction types. Amounts are signed; types describe intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[sea_orm(string_value = "payment_received")]
    PaymentReceived,
    #[sea_orm(string_value = "refund")]
    Refund,
    #[sea_orm(string_value = "fee")]
    Fee,
    #[sea_orm(string_value = "payout_requested")]
    PayoutRequested,
    #[sea_orm(string_value = "payout_completed")]
    PayoutCompleted,
    #[sea_orm(string_value = "adjustment")]
    Adjustment,
}

/// Append-only ledger row per (store, currency). For a fixed pair, ordering
/// by creation time, `balance_after[n] = balance_after[n-1] + amount[n]`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "balance_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Uuid")]
    pub id: Uuid,

    #[sea_orm(column_type = "Uuid")]
    pub store_id: Uuid,

    pub transaction_type: TransactionType,

    /// Signed amount in the transaction currency.
    pub amount: Decimal,
    pub currency: String,

    /// Running balance after applying this row.
    pub balance_after: Decimal,

    pub payment_id: Option<Uuid>,
    pub refund_id: Option<Uuid>,
    pub payout_id: Option<Uuid>,

    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
