//! End-to-end over real sockets: axum relay plus tokio-tungstenite clients.
#![cfg(all(feature = "axum", feature = "client"))]

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scenesync::axum::{router, RelayState};
use scenesync::protocol::{decode_message, encode_message, PoseRecord};
use scenesync::{
    ClientEvent, ClientMessage, ClientSession, RelayClient, ServerMessage, SessionRegistry,
    SyncMessage, UserProfile, VolatileState,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::StateVector;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_relay() -> (SocketAddr, Arc<SessionRegistry>) {
    let registry = Arc::new(SessionRegistry::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(RelayState::new(registry.clone()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, registry)
}

async fn next_message(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("relay went quiet")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return decode_message(text.as_str()).unwrap();
        }
    }
}

async fn send(socket: &mut Socket, message: &ClientMessage) {
    let text = encode_message(message).unwrap();
    socket.send(Message::Text(text.into())).await.unwrap();
}

#[tokio::test]
async fn test_malformed_frames_do_not_drop_the_connection() {
    let (addr, _registry) = start_relay().await;
    let (mut first, _) = connect_async(format!("ws://{}/gallery", addr)).await.unwrap();

    let ServerMessage::Handshake { id, others } = next_message(&mut first).await else {
        panic!("Expected handshake first");
    };
    assert!(others.is_empty());
    assert!(matches!(next_message(&mut first).await, ServerMessage::Project(_)));

    first
        .send(Message::Text("definitely not json".to_string().into()))
        .await
        .unwrap();
    send(
        &mut first,
        &ClientMessage::Pose(VolatileState {
            poses: vec![Some(PoseRecord::at(3.0, 1.5, 0.0))],
            scale: None,
        }),
    )
    .await;

    // a sync hello always gets an answer, so the pose above has been applied
    let hello = SyncMessage {
        state: StateVector::default(),
        known: None,
        update: None,
    };
    send(&mut first, &ClientMessage::Sync(hello.encode())).await;
    assert!(matches!(next_message(&mut first).await, ServerMessage::Sync(_)));

    // trailing slash names the same room
    let (mut second, _) = connect_async(format!("ws://{}/gallery/", addr)).await.unwrap();
    let ServerMessage::Handshake { others, .. } = next_message(&mut second).await else {
        panic!("Expected handshake first");
    };
    assert_eq!(others.len(), 1);
    assert_eq!(others[0].volatile.id, id);
    assert_eq!(others[0].volatile.state.head().unwrap().pos, [3.0, 1.5, 0.0]);
}

#[tokio::test]
async fn test_relay_client_reaches_synced_scene() {
    let (addr, registry) = start_relay().await;

    let session = Arc::new(Mutex::new(ClientSession::new(
        "driver",
        UserProfile::default(),
    )));
    let (tx, mut events) = mpsc::unbounded_channel();
    let client = RelayClient::new(&format!("ws://{}", addr), "lobby")
        .with_reconnect_delay(Duration::from_millis(50));
    let task = tokio::spawn(client.run(session.clone(), tx));

    let mut connected = false;
    let ready = timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected { .. } => connected = true,
                ClientEvent::SceneReady => return true,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap();

    assert!(connected && ready);
    let summaries = registry.room_summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].name, "/lobby");
    assert_eq!(summaries[0].members, 1);

    let session = session.lock().await;
    assert!(session.scene().unwrap().is_synced());
    assert!(session.id().is_some());
    drop(session);
    task.abort();
}
