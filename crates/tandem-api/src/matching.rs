use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};

use tandem_chat::{ChatError, EnqueueOutcome};
use tandem_types::api::{ApiResult, CancelResponse, Claims, EnqueueRequest, QueuePositionResponse};

use crate::error::AppResult;
use crate::state::AppState;

fn position(outcome: EnqueueOutcome) -> QueuePositionResponse {
    QueuePositionResponse {
        queue: outcome.queue,
        position: outcome.position,
    }
}

pub async fn enqueue(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EnqueueRequest>,
) -> AppResult<impl IntoResponse> {
    let preferences = req
        .preferences
        .ok_or_else(|| ChatError::Validation("missing preferences".into()))?;
    let outcome = state.matching.enqueue(claims.sub, preferences).await?;
    Ok((StatusCode::CREATED, Json(ApiResult::ok(position(outcome)))))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let removed = state.matching.cancel(claims.sub).await?;
    Ok(Json(ApiResult::ok(CancelResponse { removed })))
}

/// Where the caller waits, or `data: null` when not queued.
pub async fn status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let current = state.matching.position(claims.sub).await?.map(position);
    Ok(Json(ApiResult {
        success: true,
        error: None,
        data: current,
    }))
}
