//! Clients and relay wired together in memory, without sockets.
#![cfg(feature = "client")]

use scenesync::protocol::PoseRecord;
use scenesync::{
    ClientEvent, ClientMessage, ClientSession, GeometryRow, MaterialRow, ServerMessage,
    SessionId, SessionRegistry, UserProfile, VolatileState,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};

struct Peer {
    id: SessionId,
    session: ClientSession,
    inbox: UnboundedReceiver<ServerMessage>,
    events: Vec<ClientEvent>,
}

async fn join(registry: &SessionRegistry, room: &str, name: &str) -> Peer {
    let (tx, inbox) = mpsc::unbounded_channel();
    let id = registry.connect(room, tx).await.unwrap();
    let user = UserProfile {
        display_name: name.to_string(),
        color: [0.5, 0.5, 0.5],
    };
    let mut session = ClientSession::new(name, user);
    session.on_open();
    Peer {
        id,
        session,
        inbox,
        events: Vec::new(),
    }
}

/// Shuttle messages both ways until no sync traffic is left
async fn pump(registry: &SessionRegistry, peers: &mut [&mut Peer]) {
    for _ in 0..32 {
        let mut quiet = true;
        for peer in peers.iter_mut() {
            while let Ok(message) = peer.inbox.try_recv() {
                quiet = false;
                let events = peer.session.handle(message).unwrap();
                peer.events.extend(events);
            }

            peer.session.tick().unwrap();
            for message in peer.session.take_outbound() {
                match message {
                    ClientMessage::User(user) => {
                        quiet = false;
                        registry.update_user(&peer.id, user).await.unwrap();
                    }
                    ClientMessage::Pose(state) => {
                        registry.update_volatile(&peer.id, state).await.unwrap();
                    }
                    ClientMessage::Sync(bytes) => {
                        quiet = false;
                        registry.receive_sync(&peer.id, &bytes).await.unwrap();
                    }
                }
            }
        }
        if quiet {
            return;
        }
    }
    panic!("relay traffic did not settle");
}

fn scene_ready(peer: &Peer) -> bool {
    peer.events.contains(&ClientEvent::SceneReady)
}

#[tokio::test]
async fn test_first_client_bootstraps_and_second_binds() {
    let registry = SessionRegistry::new();
    let mut alice = join(&registry, "/studio", "alice").await;
    pump(&registry, &mut [&mut alice]).await;

    assert!(scene_ready(&alice));
    let root = alice.session.scene().unwrap().root_row().cloned();
    assert_eq!(root.as_deref(), Some("root"));

    let mut bob = join(&registry, "/studio", "bob").await;
    pump(&registry, &mut [&mut alice, &mut bob]).await;

    assert!(scene_ready(&bob));
    let bob_scene = bob.session.scene().unwrap();
    assert_eq!(bob_scene.root_row(), root.as_ref());
    assert_eq!(bob_scene.document().tables().roots().count(), 1);

    // alice heard about bob's profile
    assert!(alice.events.iter().any(|event| matches!(
        event,
        ClientEvent::User { id, user } if *id == bob.id && user.display_name == "bob"
    )));
}

#[tokio::test]
async fn test_mesh_added_by_one_client_appears_for_the_other() {
    let registry = SessionRegistry::new();
    let mut alice = join(&registry, "/studio", "alice").await;
    let mut bob = join(&registry, "/studio", "bob").await;
    pump(&registry, &mut [&mut alice, &mut bob]).await;
    assert!(scene_ready(&alice) && scene_ready(&bob));

    let mesh = {
        let scene = alice.session.scene_mut().unwrap();
        let geometry = scene
            .register_geometry(GeometryRow {
                name: "tri".to_string(),
                index: vec![0, 1, 2],
                position: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            })
            .unwrap();
        let material = scene.register_material(MaterialRow::default()).unwrap();
        scene
            .add_mesh("tri", None, geometry, material, [0.0, 1.0, 0.0])
            .unwrap()
    };
    pump(&registry, &mut [&mut alice, &mut bob]).await;

    let bob_scene = bob.session.scene().unwrap();
    let node = bob_scene.node_for(&mesh).unwrap();
    assert!(bob_scene.graph().is_attached(node));
    assert_eq!(
        bob_scene.graph().get(node).unwrap().transform.position,
        [0.0, 1.0, 0.0]
    );

    let room = registry.room("/studio").await.unwrap();
    assert!(room.lock().await.document().tables().objects.contains(&mesh));

    // a follow-up move travels the same way
    alice
        .session
        .scene_mut()
        .unwrap()
        .move_object(&mesh, [2.0, 1.0, 0.0])
        .unwrap();
    pump(&registry, &mut [&mut alice, &mut bob]).await;

    let bob_scene = bob.session.scene().unwrap();
    let node = bob_scene.node_for(&mesh).unwrap();
    assert_eq!(
        bob_scene.graph().get(node).unwrap().transform.position,
        [2.0, 1.0, 0.0]
    );
}

#[tokio::test]
async fn test_poses_reach_the_other_client_on_tick() {
    let registry = SessionRegistry::new();
    let mut alice = join(&registry, "/studio", "alice").await;
    let mut bob = join(&registry, "/studio", "bob").await;
    pump(&registry, &mut [&mut alice, &mut bob]).await;

    alice.session.set_pose(VolatileState {
        poses: vec![Some(PoseRecord::at(1.0, 1.6, -1.0))],
        scale: None,
    });
    pump(&registry, &mut [&mut alice, &mut bob]).await;
    registry.tick().await;
    pump(&registry, &mut [&mut alice, &mut bob]).await;

    let seen = bob.events.iter().rev().find_map(|event| match event {
        ClientEvent::Others(others) => Some(others.clone()),
        _ => None,
    });
    let others = seen.unwrap();
    assert_eq!(others.len(), 1);
    assert_eq!(others[0].id, alice.id);
    assert_eq!(others[0].state.head().unwrap().pos, [1.0, 1.6, -1.0]);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let registry = SessionRegistry::new();
    let mut alice = join(&registry, "/a", "alice").await;
    let mut bob = join(&registry, "/b", "bob").await;
    pump(&registry, &mut [&mut alice, &mut bob]).await;
    registry.tick().await;
    pump(&registry, &mut [&mut alice, &mut bob]).await;

    for peer in [&alice, &bob] {
        assert!(peer.events.iter().all(|event| match event {
            ClientEvent::Others(others) => others.is_empty(),
            ClientEvent::User { .. } => false,
            _ => true,
        }));
    }
    assert_eq!(registry.room_count(), 2);
}
