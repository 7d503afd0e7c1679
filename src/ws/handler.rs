use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use serde::Deserialize;
use std::net::SocketAddr;

use crate::auth::Principal;
use crate::state::AppState;
use crate::ws::actor;
use crate::ws::lifecycle::{self, ConnectMeta};

/// Query parameters for the WebSocket handshake. Auth is `?token=JWT`.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /ws?token=JWT
/// On auth failure the connection is upgraded and immediately closed with
/// 4001 (expired) or 4002 (invalid). On success an actor takes the socket.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match lifecycle::authenticate(state.verifier.as_ref(), params.token.as_deref()).await {
        Ok(principal) => {
            tracing::info!(
                user_id = %principal.user_id,
                agency_id = ?principal.agency_id,
                "WebSocket connection authenticated"
            );
            let meta = ConnectMeta {
                user_agent: headers
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                remote_address: Some(remote),
            };
            ws.on_upgrade(move |socket| handle_authenticated(socket, state, principal, meta))
        }
        Err(err) => {
            let close_code = err.close_code();
            let reason = err.to_string();

            tracing::warn!(
                close_code = close_code,
                remote = %remote,
                reason = %reason,
                "WebSocket auth failed"
            );

            ws.on_upgrade(move |mut socket| async move {
                let close_frame = CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                };
                let _ = socket.send(Message::Close(Some(close_frame))).await;
            })
        }
    }
}

async fn handle_authenticated(socket: WebSocket, state: AppState, principal: Principal, meta: ConnectMeta) {
    actor::run_connection(socket, state, principal, meta).await;
}
