use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::RelayState;
use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage, SessionId};
use crate::session::SessionRegistry;
use crate::{SyncError, SyncResult};

/// Handles the WebSocket connection of one session
pub struct WebSocketHandler {
    socket: WebSocket,
    state: RelayState,
    room: String,
}

impl WebSocketHandler {
    pub fn new(socket: WebSocket, state: RelayState, room: String) -> Self {
        Self {
            socket,
            state,
            room,
        }
    }

    /// Serve the connection until either side closes it
    pub async fn handle(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        let registry = self.state.registry().clone();
        let session_id = match registry.connect(&self.room, tx).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to register session in room '{}': {}", self.room, e);
                return;
            }
        };

        info!(
            "New WebSocket connection for session {} in room '{}'",
            session_id, self.room
        );

        let mut sender_task = {
            let session_id = session_id.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let encoded = match encode_message(&message) {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            error!("Failed to encode '{}' for {}: {}", message.cmd(), session_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Text(encoded.into())).await {
                        debug!("Failed to send to session {}: {}", session_id, e);
                        break;
                    }
                }
                debug!("Sender task ended for session {}", session_id);
            })
        };

        let mut receiver_task = {
            let registry = registry.clone();
            let session_id = session_id.clone();

            tokio::spawn(async move {
                while let Some(frame) = ws_receiver.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text.as_str().to_owned(),
                        Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Dropping non UTF-8 binary frame from {}", session_id);
                                continue;
                            }
                        },
                        Ok(Message::Close(_)) => {
                            info!("Session {} closed connection normally", session_id);
                            break;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                        Err(e) => {
                            warn!("WebSocket error for session {}: {}", session_id, e);
                            break;
                        }
                    };

                    if let Err(e) = handle_client_message(&registry, &session_id, &text).await {
                        match e {
                            SyncError::Protocol { .. } => {
                                warn!("Dropping message from {}: {}", session_id, e)
                            }
                            _ => error!("Error handling message from {}: {}", session_id, e),
                        }
                    }
                }
                debug!("Receiver task ended for session {}", session_id);
            })
        };

        let completion_reason = tokio::select! {
            _ = &mut sender_task => {
                receiver_task.abort();
                "sender task completed"
            }
            _ = &mut receiver_task => {
                sender_task.abort();
                "receiver task completed"
            }
        };

        info!(
            "WebSocket connection ending for session {} ({})",
            session_id, completion_reason
        );
        registry.disconnect(&session_id).await;
    }
}

/// Decode one text frame and apply it to the registry
pub(crate) async fn handle_client_message(
    registry: &SessionRegistry,
    session_id: &SessionId,
    data: &str,
) -> SyncResult<()> {
    let message: ClientMessage = decode_message(data)?;

    match message {
        ClientMessage::User(user) => {
            debug!("Session {} is now '{}'", session_id, user.display_name);
            registry.update_user(session_id, user).await
        }
        ClientMessage::Pose(state) => registry.update_volatile(session_id, state).await,
        ClientMessage::Sync(bytes) => registry.receive_sync(session_id, &bytes).await,
    }
}
