//! Store balance read endpoints.

use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{errors::ServiceError, handlers::common::success_response, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:store_id/balance", get(get_balances))
        .route("/:store_id/balance/summary", get(get_summary))
}

#[derive(Debug, Serialize)]
struct CurrencyBalance {
    currency: String,
    balance: Decimal,
}

#[derive(Debug, Serialize)]
struct BalancesResponse {
    store_id: Uuid,
    balances: Vec<CurrencyBalance>,
}

async fn get_balances(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let balances = state
        .services
        .ledger
        .get_balances(store_id)
        .await?
        .into_iter()
        .map(|(currency, balance)| CurrencyBalance { currency, balance })
        .collect();
    Ok(success_response(BalancesResponse { store_id, balances }))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    currency: Option<String>,
}

async fn get_summary(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
    Query(query): Query<SummaryQuery>,
) -> Result<Response, ServiceError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| to - Duration::days(30));
    let summary = state
        .services
        .ledger
        .get_summary(store_id, from, to, query.currency.as_deref())
        .await?;
    Ok(success_response(summary))
}
