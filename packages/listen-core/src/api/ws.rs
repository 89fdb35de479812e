//! WebSocket handler: the client-facing verb surface.
//!
//! Handshake auth happens before the upgrade; every verb then carries an
//! optional `ack` id that is answered on the socket's own outbound queue.
//! Routing acknowledgements through the same queue as room broadcasts keeps
//! them ordered: a `ready` that closes the gate delivers `group:play-at`
//! before its own ack.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{bearer_token, AppState};
use crate::auth::{authenticate, AuthContext};
use crate::error::{ListenError, ListenResult};
use crate::group::types::{PlaybackCmd, QueueCmd, Snapshot};
use crate::protocol_constants::{
    SOCKET_OUTBOUND_CAPACITY, WS_PING_INTERVAL_SECS, WS_PONG_TIMEOUT_SECS,
};
use crate::rooms::encode_frame;
use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming message envelope: `{"event": ..., "data": {...}, "ack": n}`.
#[derive(Deserialize)]
struct WsEnvelope {
    #[serde(default)]
    ack: Option<u64>,
    #[serde(flatten)]
    msg: WsIncoming,
}

#[derive(Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum WsIncoming {
    JoinGroup(JoinGroupPayload),
    Playback(PlaybackPayload),
    Queue(QueuePayload),
    Ready,
    LtPing,
    LeaveGroup,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinGroupPayload {
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackPayload {
    action: String,
    #[serde(default)]
    position_ms: Option<u64>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuePayload {
    action: String,
    #[serde(default)]
    track_ids: Option<Vec<String>>,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    from_index: Option<usize>,
    #[serde(default)]
    to_index: Option<usize>,
}

/// Acknowledgement payload, sent as an `ack` frame.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AckPayload {
    ack: u64,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transient: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_time: Option<u64>,
}

impl AckPayload {
    fn ok(ack: u64) -> Self {
        Self {
            ack,
            ok: true,
            error: None,
            code: None,
            transient: None,
            retryable: None,
            retry_after_ms: None,
            server_time: None,
        }
    }

    fn pong(ack: u64, server_time: u64) -> Self {
        Self {
            server_time: Some(server_time),
            ..Self::ok(ack)
        }
    }

    fn err(ack: u64, error: &ListenError) -> Self {
        let retry_after_ms = match error {
            ListenError::Conflict { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Self {
            ack,
            ok: false,
            error: Some(error.to_string()),
            code: Some(error.code()),
            transient: error.is_transient().then_some(true),
            retryable: error.is_transient().then_some(true),
            retry_after_ms,
            server_time: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload validation
// ─────────────────────────────────────────────────────────────────────────────

fn parse_playback(payload: PlaybackPayload) -> ListenResult<PlaybackCmd> {
    match payload.action.as_str() {
        "play" => Ok(PlaybackCmd::Play),
        "pause" => Ok(PlaybackCmd::Pause),
        "seek" => payload
            .position_ms
            .map(|position_ms| PlaybackCmd::Seek { position_ms })
            .ok_or_else(|| ListenError::InvalidInput("seek requires positionMs".into())),
        "next" => Ok(PlaybackCmd::Next),
        "previous" => Ok(PlaybackCmd::Previous),
        "set-track" => payload
            .index
            .map(|index| PlaybackCmd::SetTrack { index })
            .ok_or_else(|| ListenError::InvalidInput("set-track requires index".into())),
        other => Err(ListenError::InvalidInput(format!(
            "unknown playback action: {other}"
        ))),
    }
}

/// Queue payloads resolve their track ids through the validator before they
/// become commands.
async fn parse_queue(state: &AppState, payload: QueuePayload) -> ListenResult<QueueCmd> {
    match payload.action.as_str() {
        "add" | "insert-next" => {
            let track_ids = payload
                .track_ids
                .ok_or_else(|| ListenError::InvalidInput("trackIds required".into()))?;
            let items = state.validator.validate(&track_ids).await?;
            if payload.action == "add" {
                Ok(QueueCmd::Add { items })
            } else {
                Ok(QueueCmd::InsertNext { items })
            }
        }
        "remove" => payload
            .index
            .map(|index| QueueCmd::Remove { index })
            .ok_or_else(|| ListenError::InvalidInput("remove requires index".into())),
        "reorder" => match (payload.from_index, payload.to_index) {
            (Some(from), Some(to)) => Ok(QueueCmd::Reorder { from, to }),
            _ => Err(ListenError::InvalidInput(
                "reorder requires fromIndex and toIndex".into(),
            )),
        },
        "clear" => Ok(QueueCmd::Clear),
        other => Err(ListenError::InvalidInput(format!(
            "unknown queue action: {other}"
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection handling
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket upgrade handler. Authentication failures refuse the handshake
/// with an HTTP error instead of upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = bearer_token(&headers, query.token) else {
        return ListenError::AuthFailed("missing bearer token".into()).into_response();
    };
    match authenticate(state.verifier.as_ref(), state.directory.as_ref(), &token).await {
        Ok(ctx) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, ctx))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Main connection loop. All outbound traffic (acks, unicasts, room
/// broadcasts) flows through one bounded queue per socket.
async fn handle_socket(socket: WebSocket, state: AppState, ctx: AuthContext) {
    let socket_id = Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(SOCKET_OUTBOUND_CAPACITY);
    state.presence.register_socket(&socket_id, &ctx);
    log::info!(
        "[WS] Connection established: {} (user {})",
        socket_id,
        ctx.user_id
    );

    let (mut sender, mut receiver) = socket.split();

    let mut ping_interval = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                last_inbound = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&state, &socket_id, &ctx, &out_tx, &text).await;
                    }
                    // axum answers pings itself; pongs only refresh liveness
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            _ = ping_interval.tick() => {
                if last_inbound.elapsed() > Duration::from_secs(WS_PONG_TIMEOUT_SECS) {
                    log::warn!("[WS] Pong timeout, closing {}", socket_id);
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Implicit disconnect: leave the room now, membership survives until
    // the grace period expires
    if let Some(group_id) = state.presence.socket_group(&socket_id) {
        state.rooms.leave(&group_id, &socket_id);
    }
    state.presence.disconnect(&socket_id);
    log::info!("[WS] Connection closed: {}", socket_id);
}

async fn handle_text(
    state: &AppState,
    socket_id: &str,
    ctx: &AuthContext,
    out_tx: &mpsc::Sender<String>,
    text: &str,
) {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::debug!("[WS] Undecodable frame from {}: {}", socket_id, e);
            return;
        }
    };
    let ack = envelope.ack;

    let result: ListenResult<Option<u64>> = match envelope.msg {
        WsIncoming::JoinGroup(payload) => {
            join_group(state, socket_id, ctx, out_tx, &payload.group_id)
                .await
                .map(|()| None)
        }
        WsIncoming::Playback(payload) => {
            let group_id = state
                .presence
                .socket_group(socket_id)
                .ok_or(ListenError::NotInGroup);
            match (group_id, parse_playback(payload)) {
                (Ok(group_id), Ok(cmd)) => state
                    .coordinator
                    .apply_playback(&group_id, &ctx.user_id, cmd)
                    .await
                    .map(|()| None),
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        }
        WsIncoming::Queue(payload) => {
            let group_id = state
                .presence
                .socket_group(socket_id)
                .ok_or(ListenError::NotInGroup);
            match group_id {
                Ok(group_id) => match parse_queue(state, payload).await {
                    Ok(cmd) => state
                        .coordinator
                        .apply_queue(&group_id, &ctx.user_id, cmd)
                        .await
                        .map(|()| None),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        }
        WsIncoming::Ready => match state.presence.socket_group(socket_id) {
            Some(group_id) => state
                .coordinator
                .report_ready(&group_id, &ctx.user_id)
                .await
                .map(|()| None),
            None => Err(ListenError::NotInGroup),
        },
        WsIncoming::LtPing => Ok(Some(now_millis())),
        WsIncoming::LeaveGroup => {
            if let Some(group_id) = state.presence.socket_group(socket_id) {
                state.rooms.leave(&group_id, socket_id);
                state.presence.leave_group(socket_id);
                if let Err(e) = state.coordinator.leave_group(&ctx.user_id, &group_id).await {
                    log::warn!(
                        "[WS] Leave failed for {} in {}: {}",
                        ctx.user_id,
                        group_id,
                        e
                    );
                }
            }
            Ok(None)
        }
    };

    let Some(ack) = ack else { return };
    let payload = match result {
        Ok(Some(server_time)) => AckPayload::pong(ack, server_time),
        Ok(None) => AckPayload::ok(ack),
        Err(e) => AckPayload::err(ack, &e),
    };
    if out_tx.send(encode_frame("ack", &payload)).await.is_err() {
        log::debug!("[WS] Ack dropped, socket {} gone", socket_id);
    }
}

/// `join-group`: membership + group mutation, room attach, reconnect
/// sampling, then the unicast `group:state`.
async fn join_group(
    state: &AppState,
    socket_id: &str,
    ctx: &AuthContext,
    out_tx: &mpsc::Sender<String>,
    group_id: &str,
) -> ListenResult<()> {
    if group_id.trim().is_empty() {
        return Err(ListenError::InvalidInput("groupId required".into()));
    }

    let snapshot: Snapshot = state
        .coordinator
        .join_group(&ctx.user_id, &ctx.username, group_id)
        .await?;

    if let Some(latency_ms) = state.presence.join_group(socket_id, group_id) {
        log::debug!(
            "[WS] Reconnect of {} to {} after {}ms",
            ctx.user_id,
            group_id,
            latency_ms
        );
    }
    state.rooms.join(group_id, socket_id, out_tx.clone());

    // Unicast the full state before the ack so the client renders
    // immediately
    let _ = out_tx.send(encode_frame("group:state", &snapshot)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: &str) -> WsEnvelope {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn join_group_envelope_parses() {
        let env = envelope(r#"{"event":"join-group","data":{"groupId":"g1"},"ack":7}"#);
        assert_eq!(env.ack, Some(7));
        match env.msg {
            WsIncoming::JoinGroup(p) => assert_eq!(p.group_id, "g1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unit_verbs_parse_without_data() {
        assert!(matches!(
            envelope(r#"{"event":"ready"}"#).msg,
            WsIncoming::Ready
        ));
        assert!(matches!(
            envelope(r#"{"event":"lt-ping","ack":1}"#).msg,
            WsIncoming::LtPing
        ));
        assert!(matches!(
            envelope(r#"{"event":"leave-group"}"#).msg,
            WsIncoming::LeaveGroup
        ));
    }

    #[test]
    fn playback_payloads_validate() {
        let parse = |json: &str| {
            let env = envelope(json);
            match env.msg {
                WsIncoming::Playback(p) => parse_playback(p),
                _ => panic!("wrong variant"),
            }
        };

        assert_eq!(
            parse(r#"{"event":"playback","data":{"action":"play"}}"#).unwrap(),
            PlaybackCmd::Play
        );
        assert_eq!(
            parse(r#"{"event":"playback","data":{"action":"seek","positionMs":1500}}"#).unwrap(),
            PlaybackCmd::Seek { position_ms: 1500 }
        );
        assert_eq!(
            parse(r#"{"event":"playback","data":{"action":"set-track","index":2}}"#).unwrap(),
            PlaybackCmd::SetTrack { index: 2 }
        );
        // Missing required fields and unknown actions are invalid input
        assert!(parse(r#"{"event":"playback","data":{"action":"seek"}}"#).is_err());
        assert!(parse(r#"{"event":"playback","data":{"action":"shuffle"}}"#).is_err());
    }

    #[test]
    fn queue_reorder_requires_both_indices() {
        let env = envelope(r#"{"event":"queue","data":{"action":"reorder","fromIndex":1}}"#);
        let WsIncoming::Queue(payload) = env.msg else {
            panic!("wrong variant")
        };
        assert_eq!(payload.action, "reorder");
        assert_eq!(payload.from_index, Some(1));
        assert_eq!(payload.to_index, None);
    }

    #[test]
    fn conflict_ack_carries_retry_contract() {
        let payload = AckPayload::err(3, &ListenError::Conflict { retry_after_ms: 300 });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["ack"], 3);
        assert_eq!(json["ok"], false);
        assert_eq!(json["code"], "CONFLICT");
        assert_eq!(json["transient"], true);
        assert_eq!(json["retryable"], true);
        assert_eq!(json["retryAfterMs"], 300);
    }

    #[test]
    fn plain_error_ack_omits_retry_fields() {
        let payload = AckPayload::err(4, &ListenError::NotInGroup);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["code"], "NOT_IN_GROUP");
        assert_eq!(json["error"], "Not in a group");
        assert!(json.get("transient").is_none());
        assert!(json.get("retryAfterMs").is_none());
    }

    #[test]
    fn pong_ack_carries_server_time() {
        let json = serde_json::to_value(AckPayload::pong(9, 123_456)).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["serverTime"], 123_456);
    }
}
