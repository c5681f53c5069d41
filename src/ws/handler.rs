//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchCommand, MatchHandle};
use crate::http::AppError;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Outbound messages buffered per client before the match starts dropping
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Query parameters for WebSocket connection.
/// Identity is established upstream; the match only checks membership.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub match_id: Uuid,
    pub player_id: Uuid,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let handle = state
        .match_registry
        .get(&query.match_id)
        .ok_or_else(|| AppError::NotFound(format!("match {}", query.match_id)))?;

    if !handle.has_player(&query.player_id) {
        return Err(AppError::NotFound(format!(
            "player {} in match {}",
            query.player_id, query.match_id
        )));
    }

    info!(match_id = %query.match_id, player_id = %query.player_id, "WebSocket upgrade");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, query.player_id, handle)))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, player_id: Uuid, handle: MatchHandle) {
    let connection_id = Uuid::new_v4();
    let (outbound_tx, outbound_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);

    let connect = MatchCommand::Connect {
        player_id,
        connection_id,
        sender: outbound_tx,
    };
    if handle.command_tx.send(connect).await.is_err() {
        debug!(match_id = %handle.id, player_id = %player_id, "Match already ended");
        return;
    }

    let (ws_sink, ws_stream) = socket.split();
    run_session(player_id, &handle, ws_sink, ws_stream, outbound_rx).await;

    let _ = handle
        .command_tx
        .send(MatchCommand::Disconnect {
            player_id,
            connection_id,
        })
        .await;

    info!(match_id = %handle.id, player_id = %player_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    player_id: Uuid,
    handle: &MatchHandle,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    mut outbound_rx: mpsc::Receiver<ServerMsg>,
) {
    let rate_limiter = ConnectionRateLimiter::new();
    let match_id = handle.id;

    // Writer task: match -> WebSocket. Ends when the match drops the sender.
    let mut writer_handle = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(match_id = %match_id, player_id = %player_id, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Reader loop: WebSocket -> match loop
    loop {
        let result = tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(result) => result,
                None => break,
            },
            _ = &mut writer_handle => {
                debug!(match_id = %match_id, player_id = %player_id, "Writer finished, closing session");
                return;
            }
        };

        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_frame() {
                    debug!(match_id = %match_id, player_id = %player_id, "Frame dropped by flood guard");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => {
                        let command = MatchCommand::Input {
                            player_id,
                            msg,
                            received_at: unix_millis(),
                        };
                        if handle.command_tx.send(command).await.is_err() {
                            debug!(match_id = %match_id, player_id = %player_id, "Match channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(match_id = %match_id, player_id = %player_id, error = %e, "Malformed client message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(match_id = %match_id, player_id = %player_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(match_id = %match_id, player_id = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(match_id = %match_id, player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
