//! Plain HTTP handlers: health and the read-only polling fallback.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use super::{bearer_token, AppState};
use crate::auth::authenticate;
use crate::error::{ListenError, ListenResult};
use crate::group::types::Snapshot;
use crate::observability::MetricsSnapshot;
use crate::protocol_constants::SERVICE_ID;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    metrics: MetricsSnapshot,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_ID,
        metrics: state.coordinator.metrics().snapshot(),
    })
}

/// Polling fallback (`LISTEN_TOGETHER_ALLOW_POLLING`): members may read
/// the current snapshot over plain HTTP when a WebSocket is unavailable.
pub async fn group_state(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> ListenResult<Json<Snapshot>> {
    let token = bearer_token(&headers, None)
        .ok_or_else(|| ListenError::AuthFailed("missing bearer token".into()))?;
    let ctx = authenticate(state.verifier.as_ref(), state.directory.as_ref(), &token).await?;

    let snapshot = state.coordinator.current_snapshot(&group_id).await?;
    if !snapshot.members.iter().any(|m| m.user_id == ctx.user_id) {
        return Err(ListenError::NotMember);
    }
    Ok(Json(snapshot))
}
