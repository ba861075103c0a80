use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::protocol::{
    ClientMessage, PeerSummary, PeerVolatile, ServerMessage, SessionId, UserProfile,
    VolatileState,
};
use crate::scene::SharedScene;
use crate::SyncResult;

/// Things the application may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The relay assigned an id; `others` are the members already present
    Connected {
        id: SessionId,
        others: Vec<PeerSummary>,
    },
    /// First full sync with the relay finished and the scene root is bound
    SceneReady,
    User {
        id: SessionId,
        user: UserProfile,
    },
    /// Poses of the other members, own entry removed
    Others(Vec<PeerVolatile>),
    Exit(SessionId),
    Reload,
    Disconnected,
}

/// Transport-independent client state machine
///
/// Feed it server messages with [`handle`](Self::handle), call
/// [`tick`](Self::tick) at the pose rate, and ship whatever
/// [`take_outbound`](Self::take_outbound) returns.
pub struct ClientSession {
    actor: String,
    id: Option<SessionId>,
    user: UserProfile,
    volatile: VolatileState,
    scene: Option<SharedScene>,
    outbox: VecDeque<ClientMessage>,
}

impl ClientSession {
    /// `actor` labels local changes in the scene's change log
    pub fn new(actor: impl Into<String>, user: UserProfile) -> Self {
        Self {
            actor: actor.into(),
            id: None,
            user,
            volatile: VolatileState::default(),
            scene: None,
            outbox: VecDeque::new(),
        }
    }

    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn scene(&self) -> Option<&SharedScene> {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> Option<&mut SharedScene> {
        self.scene.as_mut()
    }

    /// Connection opened: announce the profile
    pub fn on_open(&mut self) {
        self.outbox.clear();
        self.outbox.push_back(ClientMessage::User(self.user.clone()));
    }

    /// Connection lost: forget the id and anything not yet sent
    pub fn on_close(&mut self) {
        self.id = None;
        self.outbox.clear();
    }

    pub fn set_pose(&mut self, volatile: VolatileState) {
        self.volatile = volatile;
    }

    pub fn set_user(&mut self, user: UserProfile) {
        self.user = user;
        if self.id.is_some() {
            self.outbox.push_back(ClientMessage::User(self.user.clone()));
        }
    }

    /// Process one message from the relay
    pub fn handle(&mut self, message: ServerMessage) -> SyncResult<Vec<ClientEvent>> {
        let mut events = Vec::new();

        match message {
            ServerMessage::Handshake { id, others } => {
                info!("Joined as {} with {} other member(s)", id, others.len());
                if let Some(scene) = self.scene.as_mut() {
                    scene.reset_relay();
                }
                self.id = Some(id.clone());
                events.push(ClientEvent::Connected { id, others });
            }
            ServerMessage::Project(snapshot) => {
                if self.scene.is_none() {
                    debug!("Seeding scene from {} byte snapshot", snapshot.len());
                    self.scene = Some(SharedScene::from_snapshot(&snapshot, self.actor.clone())?);
                }
                self.queue_sync()?;
            }
            ServerMessage::Sync(bytes) => {
                let Some(scene) = self.scene.as_mut() else {
                    warn!("Dropping sync message received before the snapshot");
                    return Ok(events);
                };
                let was_synced = scene.is_synced();
                if let Some(reply) = scene.receive_sync(&bytes)? {
                    self.outbox.push_back(ClientMessage::Sync(reply));
                }
                if !was_synced && scene.is_synced() {
                    events.push(ClientEvent::SceneReady);
                }
            }
            ServerMessage::Others(others) => {
                let others = others
                    .into_iter()
                    .filter(|peer| Some(&peer.id) != self.id.as_ref())
                    .collect();
                events.push(ClientEvent::Others(others));
            }
            ServerMessage::User { id, user } => events.push(ClientEvent::User { id, user }),
            ServerMessage::Exit(id) => events.push(ClientEvent::Exit(id)),
            ServerMessage::Reload => events.push(ClientEvent::Reload),
        }

        Ok(events)
    }

    /// Queue the periodic pose and any pending scene changes
    ///
    /// Poses are held back until the relay has assigned an id.
    pub fn tick(&mut self) -> SyncResult<()> {
        if self.id.is_some() {
            self.outbox
                .push_back(ClientMessage::Pose(self.volatile.clone()));
        }
        self.queue_sync()
    }

    /// Drain the messages waiting to be sent
    pub fn take_outbound(&mut self) -> Vec<ClientMessage> {
        self.outbox.drain(..).collect()
    }

    fn queue_sync(&mut self) -> SyncResult<()> {
        if let Some(scene) = self.scene.as_mut() {
            if let Some(bytes) = scene.generate_sync()? {
                self.outbox.push_back(ClientMessage::Sync(bytes));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PoseRecord;

    fn session() -> ClientSession {
        ClientSession::new("tester", UserProfile::default())
    }

    fn handshake(id: &str) -> ServerMessage {
        ServerMessage::Handshake {
            id: SessionId::from(id),
            others: Vec::new(),
        }
    }

    #[test]
    fn test_open_announces_user() {
        let mut session = session();
        session.on_open();
        assert_eq!(
            session.take_outbound(),
            vec![ClientMessage::User(UserProfile::default())]
        );
        assert!(session.take_outbound().is_empty());
    }

    #[test]
    fn test_pose_waits_for_id() {
        let mut session = session();
        session.set_pose(VolatileState {
            poses: vec![Some(PoseRecord::at(0.0, 1.7, 0.0)), None],
            scale: None,
        });

        session.tick().unwrap();
        assert!(session.take_outbound().is_empty());

        let events = session.handle(handshake("u1")).unwrap();
        assert!(matches!(&events[..], [ClientEvent::Connected { id, .. }] if id.as_str() == "u1"));

        session.tick().unwrap();
        let outbound = session.take_outbound();
        assert!(matches!(&outbound[..], [ClientMessage::Pose(state)] if state.poses.len() == 2));
    }

    #[test]
    fn test_own_entry_is_filtered_from_others() {
        let mut session = session();
        session.handle(handshake("me")).unwrap();

        let entry = |id: &str| PeerVolatile {
            id: SessionId::from(id),
            state: VolatileState::default(),
        };
        let events = session
            .handle(ServerMessage::Others(vec![entry("me"), entry("you")]))
            .unwrap();

        let [ClientEvent::Others(others)] = &events[..] else {
            panic!("Expected others event");
        };
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id.as_str(), "you");
    }

    #[test]
    fn test_project_seeds_scene_and_starts_sync() {
        let mut session = session();
        session.handle(handshake("u1")).unwrap();
        session.take_outbound();

        let empty = crate::document::ReplicatedDocument::new(None, "relay")
            .unwrap()
            .snapshot();
        session.handle(ServerMessage::Project(empty)).unwrap();

        assert!(session.scene().is_some());
        assert!(matches!(&session.take_outbound()[..], [ClientMessage::Sync(_)]));
    }

    #[test]
    fn test_sync_before_project_is_dropped() {
        let mut session = session();
        let events = session.handle(ServerMessage::Sync(vec![1, 2, 3])).unwrap();
        assert!(events.is_empty());
        assert!(session.take_outbound().is_empty());
    }

    #[test]
    fn test_close_forgets_id() {
        let mut session = session();
        session.handle(handshake("u1")).unwrap();
        session.on_close();
        assert!(session.id().is_none());

        session.set_user(UserProfile {
            display_name: "Ann".to_string(),
            color: [1.0, 0.0, 0.0],
        });
        assert!(session.take_outbound().is_empty());
        assert_eq!(session.user().display_name, "Ann");
    }

    #[test]
    fn test_lifecycle_events_pass_through() {
        let mut session = session();
        let exit = session.handle(ServerMessage::Exit(SessionId::from("u2"))).unwrap();
        assert_eq!(exit, vec![ClientEvent::Exit(SessionId::from("u2"))]);
        assert_eq!(
            session.handle(ServerMessage::Reload).unwrap(),
            vec![ClientEvent::Reload]
        );
    }
}
