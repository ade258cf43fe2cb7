//! Append-only balance ledger, one running balance per (store, currency).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        balance_transaction::{self, TransactionType},
        BalanceTransaction,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Optional foreign keys carried on a ledger row.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransactionRefs {
    pub payment_id: Option<Uuid>,
    pub refund_id: Option<Uuid>,
    pub payout_id: Option<Uuid>,
}

/// Signed-amount aggregation over a time window.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BalanceSummary {
    pub received: Decimal,
    pub refunded: Decimal,
    pub fees: Decimal,
    pub payouts: Decimal,
    pub adjustments: Decimal,
    pub net_change: Decimal,
}

#[derive(Clone)]
pub struct LedgerService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    // Serializes the read-compute-insert sequence per (store, currency) so
    // two concurrent writers never observe the same previous balance.
    locks: Arc<DashMap<(Uuid, String), Arc<Mutex<()>>>>,
}

impl LedgerService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db,
            event_sender,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, store_id: Uuid, currency: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((store_id, currency.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Appends one ledger row, computing the running balance from the most
    /// recent row for the same (store, currency). A payout request that
    /// would push the balance negative is rejected and nothing is inserted.
    #[instrument(skip(self, refs, description))]
    pub async fn add_transaction(
        &self,
        store_id: Uuid,
        transaction_type: TransactionType,
        amount: Decimal,
        currency: &str,
        refs: TransactionRefs,
        description: Option<String>,
    ) -> Result<balance_transaction::Model, ServiceError> {
        let lock = self.lock_for(store_id, currency);
        let _guard = lock.lock().await;

        let txn = self.db.begin().await?;

        let previous = BalanceTransaction::find()
            .filter(balance_transaction::Column::StoreId.eq(store_id))
            .filter(balance_transaction::Column::Currency.eq(currency))
            .order_by_desc(balance_transaction::Column::CreatedAt)
            .one(&txn)
            .await?;

        let balance_after = previous
            .map(|row| row.balance_after)
            .unwrap_or(Decimal::ZERO)
            + amount;

        if transaction_type == TransactionType::PayoutRequested && balance_after < Decimal::ZERO {
            // Never inserted; the ledger stays exactly as it was.
            return Err(ServiceError::InsufficientBalance(format!(
                "payout of {} {} would overdraw store {}",
                amount.abs(),
                currency,
                store_id
            )));
        }

        let row = balance_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            store_id: Set(store_id),
            transaction_type: Set(transaction_type),
            amount: Set(amount),
            currency: Set(currency.to_string()),
            balance_after: Set(balance_after),
            payment_id: Set(refs.payment_id),
            refund_id: Set(refs.refund_id),
            payout_id: Set(refs.payout_id),
            description: Set(description),
            created_at: Set(Utc::now()),
        };
        let inserted = row.insert(&txn).await?;
        txn.commit().await?;

        info!(
            store_id = %store_id,
            currency,
            amount = %amount,
            balance_after = %balance_after,
            "ledger transaction recorded"
        );

        self.event_sender
            .send(Event::BalanceTransactionRecorded {
                store_id,
                transaction_id: inserted.id,
                balance_after,
                currency: currency.to_string(),
            })
            .await;

        Ok(inserted)
    }

    /// Latest running balance for one currency (zero when no rows exist).
    pub async fn get_balance(
        &self,
        store_id: Uuid,
        currency: &str,
    ) -> Result<Decimal, ServiceError> {
        let latest = BalanceTransaction::find()
            .filter(balance_transaction::Column::StoreId.eq(store_id))
            .filter(balance_transaction::Column::Currency.eq(currency))
            .order_by_desc(balance_transaction::Column::CreatedAt)
            .one(&*self.db)
            .await?;
        Ok(latest.map(|row| row.balance_after).unwrap_or(Decimal::ZERO))
    }

    /// Latest running balance per currency the store has ever transacted in.
    pub async fn get_balances(
        &self,
        store_id: Uuid,
    ) -> Result<Vec<(String, Decimal)>, ServiceError> {
        let currencies: Vec<String> = BalanceTransaction::find()
            .filter(balance_transaction::Column::StoreId.eq(store_id))
            .select_only()
            .column(balance_transaction::Column::Currency)
            .distinct()
            .into_tuple()
            .all(&*self.db)
            .await?;

        let mut balances = Vec::with_capacity(currencies.len());
        for currency in currencies {
            let balance = self.get_balance(store_id, &currency).await?;
            balances.push((currency, balance));
        }
        Ok(balances)
    }

    /// Aggregates signed amounts by type over a window. Pure read side.
    pub async fn get_summary(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        currency: Option<&str>,
    ) -> Result<BalanceSummary, ServiceError> {
        let mut query = BalanceTransaction::find()
            .filter(balance_transaction::Column::StoreId.eq(store_id))
            .filter(balance_transaction::Column::CreatedAt.gte(from))
            .filter(balance_transaction::Column::CreatedAt.lte(to));
        if let Some(currency) = currency {
            query = query.filter(balance_transaction::Column::Currency.eq(currency));
        }
        let rows = query.all(&*self.db).await?;
        Ok(summarize(&rows))
    }
}

fn summarize(rows: &[balance_transaction::Model]) -> BalanceSummary {
    let mut summary = BalanceSummary::default();
    for row in rows {
        match row.transaction_type {
            TransactionType::PaymentReceived => summary.received += row.amount,
            TransactionType::Refund => summary.refunded += row.amount,
            TransactionType::Fee => summary.fees += row.amount,
            TransactionType::PayoutRequested | TransactionType::PayoutCompleted => {
                summary.payouts += row.amount
            }
            TransactionType::Adjustment => summary.adjustments += row.amount,
        }
        summary.net_change += row.amount;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(transaction_type: TransactionType, amount: Decimal) -> balance_transaction::Model {
        balance_transaction::Model {
            id: Uuid::new_v4(),
            store_id: Uuid::new_v4(),
            transaction_type,
            amount,
            currency: "USD".to_string(),
            balance_after: Decimal::ZERO,
            payment_id: None,
            refund_id: None,
            payout_id: None,
            description: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn summary_buckets_signed_amounts_by_type() {
        let rows = vec![
            row(TransactionType::PaymentReceived, dec!(100)),
            row(TransactionType::Fee, dec!(-2.90)),
            row(TransactionType::Refund, dec!(-30)),
            row(TransactionType::PayoutRequested, dec!(-50)),
            row(TransactionType::Adjustment, dec!(5)),
        ];
        let summary = summarize(&rows);
        assert_eq!(summary.received, dec!(100));
        assert_eq!(summary.fees, dec!(-2.90));
        assert_eq!(summary.refunded, dec!(-30));
        assert_eq!(summary.payouts, dec!(-50));
        assert_eq!(summary.adjustments, dec!(5));
        assert_eq!(summary.net_change, dec!(22.10));
    }
}
