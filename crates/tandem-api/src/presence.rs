use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use tandem_chat::ChatError;
use tandem_types::api::{ApiResult, PresenceEntry};

use crate::error::AppResult;
use crate::state::AppState;

const MAX_IDS: usize = 500;

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    /// Comma-separated user ids
    pub ids: String,
}

fn parse_ids(raw: &str) -> Result<Vec<Uuid>, ChatError> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(s).map_err(|_| ChatError::Validation(format!("invalid user id '{s}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.len() > MAX_IDS {
        return Err(ChatError::Validation(format!("at most {MAX_IDS} ids per lookup")));
    }
    Ok(ids)
}

/// Online status of the requested users, in request order.
pub async fn bulk_status(
    State(state): State<AppState>,
    Query(query): Query<PresenceQuery>,
) -> AppResult<impl IntoResponse> {
    let ids = parse_ids(&query.ids)?;
    let status = state.chat.presence.bulk_status(&ids).await?;
    let entries: Vec<PresenceEntry> = ids
        .into_iter()
        .map(|user_id| PresenceEntry {
            user_id,
            online: status.get(&user_id).copied().unwrap_or(false),
        })
        .collect();
    Ok(Json(ApiResult::ok(entries)))
}

pub async fn online_users(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let users = state.chat.presence.all_online().await?;
    Ok(Json(ApiResult::ok(users)))
}
