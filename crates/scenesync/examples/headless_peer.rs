//! Joins a room as a scripted peer: walks in a circle and, once the scene is
//! synced, drops a triangle under the root.
//!
//! ```text
//! cargo run --example headless_peer -- ws://localhost:8080 lobby
//! ```

use std::sync::Arc;

use scenesync::protocol::PeerVolatile;
use scenesync::{
    ClientEvent, ClientSession, GeometryRow, MaterialRow, PoseRecord, RelayClient, UserProfile,
    VolatileState,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut args = std::env::args().skip(1);
    let base = args.next().unwrap_or_else(|| "ws://localhost:8080".to_string());
    let room = args.next().unwrap_or_else(|| "lobby".to_string());

    let user = UserProfile {
        display_name: "headless".to_string(),
        color: [0.2, 0.6, 1.0],
    };
    let session = Arc::new(Mutex::new(ClientSession::new("headless", user)));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let client = RelayClient::new(&base, &room);
    info!("Connecting to {}", client.url());
    tokio::spawn(client.run(session.clone(), tx));

    let mut step = 0u32;
    while let Some(event) = rx.recv().await {
        match event {
            ClientEvent::Connected { id, others } => {
                info!("Joined as {} alongside {} peer(s)", id, others.len())
            }
            ClientEvent::SceneReady => {
                if let Err(e) = place_triangle(&session).await {
                    warn!("Could not place triangle: {}", e);
                }
            }
            ClientEvent::Others(others) => {
                step += 1;
                walk(&session, step).await;
                log_peers(step, &others);
            }
            ClientEvent::User { id, user } => info!("{} is now '{}'", id, user.display_name),
            ClientEvent::Exit(id) => info!("{} left", id),
            ClientEvent::Reload => info!("Relay asked for a reload"),
            ClientEvent::Disconnected => info!("Disconnected, retrying"),
        }
    }
}

async fn place_triangle(session: &Mutex<ClientSession>) -> scenesync::SyncResult<()> {
    let mut session = session.lock().await;
    let Some(scene) = session.scene_mut() else {
        return Ok(());
    };

    let geometry = scene.register_geometry(GeometryRow {
        name: "triangle".to_string(),
        index: vec![0, 1, 2],
        position: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    })?;
    let material = scene.register_material(MaterialRow {
        name: "orange".to_string(),
        color: [1.0, 0.5, 0.0],
        ..Default::default()
    })?;
    let mesh = scene.add_mesh("triangle", None, geometry, material, [0.0, 1.0, -2.0])?;
    info!("Placed mesh {} ({} nodes in graph)", mesh, scene.graph().len());
    Ok(())
}

async fn walk(session: &Mutex<ClientSession>, step: u32) {
    let angle = step as f64 / 60.0;
    session.lock().await.set_pose(VolatileState {
        poses: vec![Some(PoseRecord::at(angle.cos() * 2.0, 1.7, angle.sin() * 2.0))],
        scale: None,
    });
}

fn log_peers(step: u32, others: &[PeerVolatile]) {
    if step % 300 == 0 {
        info!("{} other peer(s) in the room", others.len());
    }
}
