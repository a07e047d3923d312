use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;
use crate::{events, polls, reminders, treasures, wallet};

async fn health() -> &'static str {
    "ok"
}

/// Every command route, behind bearer authentication, plus `/health`.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/wallet", get(wallet::balance))
        .route("/wallet/history", get(wallet::history))
        .route("/wallet/transfer", post(wallet::transfer))
        .route("/wallet/grant", post(wallet::grant))
        .route("/treasures", post(treasures::mint).get(treasures::list_mine))
        .route("/treasures/{code}", get(treasures::get))
        .route("/treasures/{code}/redeem", post(treasures::redeem))
        .route("/polls", post(polls::create).get(polls::list_open))
        .route("/polls/{poll_id}", get(polls::get).delete(polls::delete))
        .route("/polls/{poll_id}/vote", post(polls::vote))
        .route("/polls/{poll_id}/comments", post(polls::comment))
        .route("/polls/{poll_id}/close", post(polls::close))
        .route("/events", post(events::create).get(events::list_live))
        .route("/events/{event_id}", get(events::get))
        .route("/events/{event_id}/respond", post(events::respond))
        .route("/events/{event_id}/cancel", post(events::cancel))
        .route("/events/{event_id}/start", post(events::start))
        .route("/reminders", post(reminders::schedule).get(reminders::list_mine))
        .route("/reminders/{id}", delete(reminders::cancel))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(protected)
}
