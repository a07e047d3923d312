use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};

use guildhall_types::api::{MintTreasureRequest, RedeemResponse, TreasureListResponse};
use guildhall_types::models::{Treasure, User};

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn mint(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<MintTreasureRequest>,
) -> ApiResult<(StatusCode, Json<Treasure>)> {
    let treasure = state
        .engines
        .treasures
        .mint(&user, req.code.as_deref(), req.value, req.creator_paid)
        .await?;
    Ok((StatusCode::CREATED, Json(treasure)))
}

pub async fn redeem(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(code): Path<String>,
) -> ApiResult<Json<RedeemResponse>> {
    let won = state.engines.treasures.redeem(&user, &code).await?;
    Ok(Json(RedeemResponse {
        code: won.treasure.code,
        value: won.treasure.value,
        balance: won.balance,
    }))
}

pub async fn get(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Treasure>> {
    Ok(Json(state.engines.treasures.get(&code).await?))
}

/// Treasures minted by the caller.
pub async fn list_mine(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<TreasureListResponse>> {
    let treasures = state.engines.treasures.list_by_creator(user.id).await?;
    Ok(Json(TreasureListResponse { treasures }))
}
