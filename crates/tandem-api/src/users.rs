use axum::{
    Extension,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;
use uuid::Uuid;

use tandem_chat::ChatError;
use tandem_types::api::Claims;

use crate::error::AppResult;
use crate::state::AppState;

/// Block another user. Takes effect for joins immediately and for matching
/// from the caller's next enqueue.
pub async fn block_user(
    State(state): State<AppState>,
    Path(blocked_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> AppResult<StatusCode> {
    if blocked_id == claims.sub {
        return Err(ChatError::Validation("cannot block yourself".into()).into());
    }
    let store = &state.chat.store;
    if store.user_profile(blocked_id).await?.is_none() {
        return Err(ChatError::NotFound("user").into());
    }
    store.block_user(claims.sub, blocked_id).await?;
    info!("User {} blocked {}", claims.sub, blocked_id);
    Ok(StatusCode::NO_CONTENT)
}
