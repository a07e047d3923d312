use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use guildhall_types::api::{
    BalanceResponse, GrantRequest, HistoryResponse, TransferRequest, TransferResponse,
};
use guildhall_types::models::{Transaction, User};

use crate::auth::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

pub async fn balance(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.engines.wallet.balance(user.id).await?;
    Ok(Json(BalanceResponse {
        user_id: user.id,
        balance,
    }))
}

pub async fn history(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let (balance, transactions) = state.engines.wallet.history(user.id, query.limit).await?;
    Ok(Json(HistoryResponse {
        balance,
        transactions,
    }))
}

pub async fn transfer(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<TransferResponse>> {
    let transfer = state
        .engines
        .wallet
        .transfer(&user, req.to, req.amount, req.note.as_deref())
        .await?;
    Ok(Json(TransferResponse {
        debit: transfer.debit,
        balance: transfer.from_balance,
    }))
}

pub async fn grant(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<GrantRequest>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    let tx = state
        .engines
        .wallet
        .grant(&user, req.user_id, req.delta, &req.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(tx)))
}
