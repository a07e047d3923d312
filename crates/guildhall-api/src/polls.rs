use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use guildhall_types::api::{
    ClosePollResponse, CommentRequest, CreatePollRequest, PollResponse, VoteRequest, VoteResponse,
};
use guildhall_types::models::{Poll, PollComment, User};

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<CreatePollRequest>,
) -> ApiResult<(StatusCode, Json<Poll>)> {
    let poll = state
        .engines
        .polls
        .create(&user, &req.question, req.description.as_deref(), req.expires_at)
        .await?;
    Ok((StatusCode::CREATED, Json(poll)))
}

pub async fn list_open(State(state): State<AppState>) -> ApiResult<Json<Vec<Poll>>> {
    Ok(Json(state.engines.polls.list_open().await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(poll_id): Path<Uuid>,
) -> ApiResult<Json<PollResponse>> {
    Ok(Json(state.engines.polls.get(poll_id).await?))
}

pub async fn vote(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(poll_id): Path<Uuid>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<Json<VoteResponse>> {
    let changed = state.engines.polls.vote(poll_id, &user, req.choice).await?;
    Ok(Json(VoteResponse { changed }))
}

pub async fn comment(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(poll_id): Path<Uuid>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<(StatusCode, Json<PollComment>)> {
    let comment = state
        .engines
        .polls
        .comment(poll_id, &user, req.mood, &req.text)
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn close(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(poll_id): Path<Uuid>,
) -> ApiResult<Json<ClosePollResponse>> {
    let (poll, tally) = state.engines.polls.close(poll_id, &user).await?;
    Ok(Json(ClosePollResponse { poll, tally }))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(poll_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engines.polls.delete(poll_id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}
