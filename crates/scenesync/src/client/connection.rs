use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ClientEvent, ClientSession};
use crate::protocol::{decode_message, encode_message, ServerMessage};
use crate::session::normalize_room_name;
use crate::{SyncError, SyncResult};

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// WebSocket driver for a [`ClientSession`]
///
/// Reconnects after a fixed delay, forever, until the event receiver is
/// dropped.
#[derive(Debug, Clone)]
pub struct RelayClient {
    url: String,
    reconnect_delay: Duration,
    pose_interval: Duration,
}

impl RelayClient {
    /// `base_url` is the relay origin, e.g. `ws://localhost:8080`
    pub fn new(base_url: &str, room: &str) -> Self {
        Self {
            url: format!(
                "{}{}",
                base_url.trim_end_matches('/'),
                normalize_room_name(room)
            ),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            pose_interval: Duration::from_secs(1) / 30,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_pose_interval(mut self, interval: Duration) -> Self {
        self.pose_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn run(
        self,
        session: Arc<Mutex<ClientSession>>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!("Connected to {}", self.url);
                    if let Err(e) = self.drive(stream, &session, &events).await {
                        warn!("Connection to {} failed: {}", self.url, e);
                    }
                }
                Err(e) => warn!("Cannot reach {}: {}", self.url, e),
            }

            session.lock().await.on_close();
            if events.send(ClientEvent::Disconnected).is_err() {
                debug!("Event receiver dropped, stopping client");
                return;
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn drive(
        &self,
        stream: RelayStream,
        session: &Mutex<ClientSession>,
        events: &mpsc::UnboundedSender<ClientEvent>,
    ) -> SyncResult<()> {
        let (mut write, mut read) = stream.split();
        session.lock().await.on_open();

        let mut ticker = tokio::time::interval(self.pose_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let outgoing = session.lock().await.take_outbound();
            for message in outgoing {
                let text = encode_message(&message)?;
                write
                    .send(Message::Text(text.into()))
                    .await
                    .map_err(|e| SyncError::Transport(e.to_string()))?;
            }

            tokio::select! {
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Dropping non UTF-8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(SyncError::Transport(e.to_string())),
                    };

                    let message: ServerMessage = match decode_message(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Dropping message from relay: {}", e);
                            continue;
                        }
                    };

                    let handled = session.lock().await.handle(message);
                    match handled {
                        Ok(emitted) => {
                            for event in emitted {
                                if events.send(event).is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => warn!("Failed to apply relay message: {}", e),
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = session.lock().await.tick() {
                        warn!("Failed to prepare outbound sync: {}", e);
                    }
                }
            }
        }
    }
}
