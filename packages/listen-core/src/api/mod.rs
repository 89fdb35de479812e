//! HTTP and WebSocket surface.

mod http;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthVerifier, UserDirectory};
use crate::catalog::TrackValidator;
use crate::coordinator::GroupCoordinator;
use crate::error::{ListenError, ListenResult};
use crate::presence::PresenceLayer;
use crate::protocol_constants::SOCKET_PATH;
use crate::rooms::RoomRegistry;

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<GroupCoordinator>,
    pub presence: Arc<PresenceLayer>,
    pub rooms: Arc<RoomRegistry>,
    pub verifier: Arc<dyn AuthVerifier>,
    pub directory: Arc<dyn UserDirectory>,
    pub validator: Arc<TrackValidator>,
    pub allow_polling: bool,
}

/// Extracts the bearer token from the `Authorization` header or an explicit
/// query-supplied fallback (browsers cannot set headers on WebSocket
/// handshakes).
pub(crate) fn bearer_token(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(query_token)
}

/// Builds the router: the dedicated WebSocket endpoint, health, and (when
/// enabled) the read-only polling fallback.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(http::health))
        .route(SOCKET_PATH, get(ws::ws_handler));
    if state.allow_polling {
        router = router.route(
            "/listen-together/groups/{group_id}/state",
            get(http::group_state),
        );
    }
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves until the process is stopped.
pub async fn start_server(state: AppState, addr: SocketAddr) -> ListenResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ListenError::Infrastructure(format!("bind {addr}: {e}")))?;
    log::info!("[Api] Listening on {} (ws at {})", addr, SOCKET_PATH);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ListenError::Infrastructure(format!("server: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_token_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(
            bearer_token(&headers, Some("query".into())),
            Some("abc".into())
        );
    }

    #[test]
    fn bearer_token_falls_back_to_query() {
        assert_eq!(
            bearer_token(&HeaderMap::new(), Some("query".into())),
            Some("query".into())
        );
        assert_eq!(bearer_token(&HeaderMap::new(), None), None);
    }

    #[test]
    fn non_bearer_scheme_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers, None), None);
    }
}
