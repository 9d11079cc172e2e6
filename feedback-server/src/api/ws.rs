// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Duplex front-end connection.
//!
//! Each socket becomes a [`Connection`] handed to the session manager. Frames
//! the session writes arrive on the receiver half and are forwarded here; the
//! socket closes once the owning session drops the connection.

use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use feedback_core::{Connection, InboundMessage, OutboundMessage};
use futures::{SinkExt, StreamExt as FuturesStreamExt};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// GET /ws - Upgrade to the session protocol
pub async fn ws_session(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    debug!("WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_session_socket(socket, state))
}

fn encode(message: &OutboundMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(payload) => Some(Message::Text(payload)),
        Err(e) => {
            warn!(kind = message.kind(), error = %e, "Failed to serialize outbound frame");
            None
        }
    }
}

async fn handle_session_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound) = Connection::channel();

    let connection_id = match state.manager.attach_connection(connection) {
        Ok(id) => id,
        Err(e) => {
            info!(error = %e, "Rejecting connection");
            if let Some(frame) = encode(&OutboundMessage::error(e.to_string())) {
                let _ = sender.send(frame).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!(%connection_id, "Front end connected");

    let mut ping_interval = interval(PING_INTERVAL);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    warn!(%connection_id, "Client unresponsive, closing socket");
                    break;
                }
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }

            frame = outbound.recv() => {
                let Some(message) = frame else {
                    // The owning session dropped the connection.
                    debug!(%connection_id, "Connection released by session");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if let Some(frame) = encode(&message) {
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
            }

            next = FuturesStreamExt::next(&mut receiver) => {
                match next {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%connection_id, "Client closed socket");
                        break;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_pong = Instant::now();
                        match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(message) => {
                                let kind = message.kind();
                                if let Err(e) = state.manager.dispatch(connection_id, message).await {
                                    debug!(%connection_id, kind, error = %e, "Frame not handled");
                                }
                            }
                            Err(e) => {
                                debug!(%connection_id, error = %e, "Invalid frame");
                                let reply = OutboundMessage::error(format!("Invalid message: {}", e));
                                if let Some(frame) = encode(&reply) {
                                    if sender.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(%connection_id, "Ignoring binary frame");
                    }
                    Some(Err(e)) => {
                        warn!(%connection_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    state.manager.connection_closed(connection_id);
    info!(%connection_id, "Front end disconnected");
}
