use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};

use guildhall_types::api::{CreateEventRequest, EventResponse, RespondRequest, RsvpResponse};
use guildhall_types::models::{MmEvent, User};

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateEventRequest>,
) -> ApiResult<(StatusCode, Json<MmEvent>)> {
    let event = state
        .engines
        .matchmaking
        .create(
            &user,
            &req.title,
            req.description.as_deref(),
            req.when,
            req.interface.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

pub async fn list_live(State(state): State<AppState>) -> ApiResult<Json<Vec<MmEvent>>> {
    Ok(Json(state.engines.matchmaking.list_live().await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> ApiResult<Json<EventResponse>> {
    Ok(Json(state.engines.matchmaking.get(event_id).await?))
}

pub async fn respond(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(event_id): Path<i64>,
    Json(req): Json<RespondRequest>,
) -> ApiResult<Json<RsvpResponse>> {
    let rsvp = state
        .engines
        .matchmaking
        .respond(event_id, &user, req.choice)
        .await?;
    Ok(Json(RsvpResponse {
        changed: rsvp.changed,
        awarded: rsvp.awarded,
    }))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(event_id): Path<i64>,
) -> ApiResult<Json<MmEvent>> {
    Ok(Json(state.engines.matchmaking.cancel(event_id, &user).await?))
}

pub async fn start(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(event_id): Path<i64>,
) -> ApiResult<Json<MmEvent>> {
    Ok(Json(
        state.engines.matchmaking.start_now(event_id, &user).await?,
    ))
}
