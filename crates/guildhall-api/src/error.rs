use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use guildhall_engine::{Error, ErrorKind};
use guildhall_types::api::ErrorResponse;

/// Engine errors as HTTP responses: `{"kind": "...", "error": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyRedeemed
        | ErrorKind::DuplicateCode
        | ErrorKind::PollClosed
        | ErrorKind::EventClosed => StatusCode::CONFLICT,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Unauthorised => StatusCode::FORBIDDEN,
        ErrorKind::ExternalTransient | ErrorKind::ExternalPermanent => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let message = if kind == ErrorKind::Internal {
            error!("Request failed: {:?}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorResponse {
            kind: kind.as_str().to_string(),
            error: message,
        };
        (status_for(kind), Json(body)).into_response()
    }
}
