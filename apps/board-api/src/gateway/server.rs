//! WebSocket admission and the per-connection reader/writer pair.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::middleware::AuthUser;
use crate::auth::Identity;
use crate::config::HubConfig;
use crate::error::{ApiError, GatewayError};
use crate::AppState;

use super::events::{is_identifier, Envelope, ServerEvent};
use super::handler::{handle_frame, presence_touch};
use super::hub::DisconnectReason;
use super::presence::{board_snapshot, spawn_presence_update};
use super::session::Connection;

/// Consecutive undecodable frames tolerated before the reader gives up.
const MAX_DECODE_FAULTS: u32 = 5;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/boards/{board_id}", get(ws_upgrade))
}

/// Admit a client to a board. Identity and board access are checked before
/// the upgrade, so a rejected client never gets a connection.
async fn ws_upgrade(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
    AuthUser(identity): AuthUser,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    if !is_identifier(&board_id) {
        return Err(ApiError::bad_request("Invalid board id"));
    }

    if !state
        .boards
        .has_board_access(&identity.user_id, &board_id)
        .await?
    {
        tracing::info!(%board_id, user_id = %identity.user_id, "board access denied");
        return Err(ApiError::forbidden("You do not have access to this board"));
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let max_message_bytes = state.hub.config().max_message_bytes;
    Ok(ws
        .max_message_size(max_message_bytes)
        .max_frame_size(max_message_bytes)
        .on_upgrade(move |socket| handle_connection(socket, state, board_id, identity)))
}

async fn handle_connection(socket: WebSocket, state: AppState, board_id: String, identity: Identity) {
    let config = Arc::new(state.hub.config().clone());
    let (conn, outbound) = Connection::new(&board_id, identity, config.outbound_capacity);
    let (mut ws_tx, ws_rx) = socket.split();

    // The snapshot is queued before registration so it is the first frame
    // the client sees.
    let snapshot = board_snapshot(&state.hub, state.presence.as_ref(), &conn).await;
    let _ = conn.send_event(&Envelope::new(
        ServerEvent::BoardSnapshot(snapshot),
        conn.user_id(),
        &board_id,
    ));

    // The coordinator announces "joined" when this is the user's first
    // connection on the board.
    if let Err(err) = state.hub.register(conn.clone()) {
        tracing::warn!(%err, %board_id, user_id = %conn.user_id(), "rejecting connection");
        let _ = send_close(&mut ws_tx, close_code::AGAIN, "Server busy").await;
        return;
    }

    tracing::info!(
        %board_id,
        user_id = %conn.user_id(),
        connection_id = %conn.id,
        "board connection established"
    );

    spawn_presence_update(state.presence.clone(), presence_touch(&conn));

    let mut reader = tokio::spawn(read_loop(state.clone(), conn.clone(), ws_rx));
    let mut writer = tokio::spawn(write_loop(ws_tx, outbound, config.clone()));

    let reason = tokio::select! {
        result = &mut reader => {
            let reason = result.unwrap_or(DisconnectReason::TransportError);
            // Unregistering closes the outbound queue, so the writer flushes
            // what is queued and sends a close frame.
            state.hub.unregister(conn.clone(), reason);
            if time::timeout(config.write_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
            reason
        }
        result = &mut writer => {
            reader.abort();
            let reason = result.unwrap_or(DisconnectReason::TransportError);
            state.hub.unregister(conn.clone(), reason);
            reason
        }
    };

    tracing::info!(
        %board_id,
        user_id = %conn.user_id(),
        connection_id = %conn.id,
        reason = reason.as_str(),
        "board connection ended"
    );
}

/// Read client frames until the transport ends, the client goes quiet, or it
/// keeps sending garbage.
async fn read_loop(state: AppState, conn: Arc<Connection>, mut ws_rx: WsStream) -> DisconnectReason {
    let idle_timeout = state.hub.config().idle_timeout;
    let mut decode_faults = 0u32;

    loop {
        let msg = match time::timeout(idle_timeout, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => {
                tracing::debug!(?err, connection_id = %conn.id, "ws read error");
                return DisconnectReason::TransportError;
            }
            Ok(None) => return DisconnectReason::TransportError,
            Err(_) => {
                tracing::debug!(connection_id = %conn.id, "idle timeout");
                return DisconnectReason::IdleTimeout;
            }
        };

        conn.touch();

        let result = match msg {
            Message::Text(text) => handle_frame(&state, &conn, text.as_str()).await,
            Message::Binary(_) => Err(GatewayError::InvalidPayload(
                "binary frames are not supported".to_string(),
            )),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return DisconnectReason::ClientClosed,
        };

        let Err(err) = result else {
            decode_faults = 0;
            continue;
        };

        if err.is_decode_fault() {
            decode_faults += 1;
        } else {
            decode_faults = 0;
        }
        tracing::debug!(
            connection_id = %conn.id,
            code = err.code(),
            decode_faults,
            "rejected client event"
        );

        if conn
            .send_event(&Envelope::error(&err, &conn.board_id))
            .is_err()
        {
            tracing::debug!(connection_id = %conn.id, "could not queue error frame");
        }

        if decode_faults >= MAX_DECODE_FAULTS {
            tracing::info!(connection_id = %conn.id, "too many malformed frames");
            return DisconnectReason::DecodeFaults;
        }
    }
}

/// Drain the outbound queue to the socket and keep the link alive with pings.
async fn write_loop(
    mut ws_tx: WsSink,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    config: Arc<HubConfig>,
) -> DisconnectReason {
    let mut ping = time::interval(config.ping_interval);
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        let message = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => {
                    let _ = time::timeout(
                        config.write_timeout,
                        send_close(&mut ws_tx, close_code::AWAY, "Connection closed"),
                    )
                    .await;
                    return DisconnectReason::ServerClosed;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match time::timeout(config.write_timeout, ws_tx.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(?err, "ws write error");
                return DisconnectReason::TransportError;
            }
            Err(_) => return DisconnectReason::WriteTimeout,
        }
    }
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &'static str) -> Result<(), axum::Error> {
    ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await
}
