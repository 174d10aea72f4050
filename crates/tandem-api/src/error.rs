use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use tandem_chat::{ChatError, ErrorKind};
use tandem_types::api::ApiResult;

/// Handler error: a [`ChatError`] rendered as an `ApiResult` body with a
/// status matching its kind.
#[derive(Debug)]
pub struct AppError(pub ChatError);

pub type AppResult<T> = Result<T, AppError>;

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self(ChatError::Store(err))
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!("Request failed: {}", self.0);
        }
        let body = ApiResult::err(self.0.code(), self.0.to_string());
        (status, Json(body)).into_response()
    }
}
