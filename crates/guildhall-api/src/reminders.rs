use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};

use guildhall_types::Address;
use guildhall_types::api::{RemindersResponse, ScheduleReminderRequest, ScheduledReminderResponse};
use guildhall_types::models::User;

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn schedule(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<ScheduleReminderRequest>,
) -> ApiResult<(StatusCode, Json<ScheduledReminderResponse>)> {
    let address = Address::new(req.interface, req.target);
    let scheduled = state
        .engines
        .reminders
        .schedule(&user, address, req.fire_at, &req.text)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ScheduledReminderResponse {
            reminder: scheduled.reminder,
            failed: scheduled.failed,
        }),
    ))
}

pub async fn list_mine(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> ApiResult<Json<RemindersResponse>> {
    Ok(Json(state.engines.reminders.list_for(user.id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.engines.reminders.cancel(id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}
