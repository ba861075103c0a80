use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::id::{IdSource, UuidSource};
use super::room::Room;
use crate::protocol::{ServerMessage, SessionId, UserProfile, VolatileState};
use crate::{SyncError, SyncResult};

#[cfg(feature = "persistence")]
use crate::persistence::RoomArchive;

/// Default grace period before an empty room is dropped
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);

/// Room listing entry for administrative views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    pub name: String,
    pub members: usize,
}

/// All connected sessions and the rooms they belong to
///
/// Each room is guarded by its own mutex, which serializes document mutation,
/// sync generation and broadcast for that room. Messages are only queued on
/// per-session channels while a room lock is held.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<Room>>>,
    rooms: DashMap<String, Arc<Mutex<Room>>>,
    ids: Arc<dyn IdSource>,
    idle_ttl: Duration,
    #[cfg(feature = "persistence")]
    archive: Option<Arc<RoomArchive>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            ids: Arc::new(UuidSource),
            idle_ttl: DEFAULT_IDLE_TTL,
            #[cfg(feature = "persistence")]
            archive: None,
        }
    }

    pub fn with_id_source(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Load rooms from and archive them to `archive`
    #[cfg(feature = "persistence")]
    pub fn with_archive(mut self, archive: RoomArchive) -> Self {
        self.archive = Some(Arc::new(archive));
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Look up a room, creating it on first reference
    pub async fn room(&self, name: &str) -> SyncResult<Arc<Mutex<Room>>> {
        if let Some(room) = self.rooms.get(name) {
            return Ok(room.value().clone());
        }

        let snapshot = self.load_snapshot(name).await;
        let room = Arc::new(Mutex::new(Room::new(name, snapshot.as_deref())?));
        let room = self
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("Created room '{}'", name);
                room
            })
            .value()
            .clone();
        Ok(room)
    }

    /// Register a new session in `room_name`
    ///
    /// The handshake and the document snapshot are queued on `sender` before
    /// this returns.
    pub async fn connect(
        &self,
        room_name: &str,
        sender: UnboundedSender<ServerMessage>,
    ) -> SyncResult<SessionId> {
        loop {
            let room = self.room(room_name).await?;
            let mut guard = room.lock().await;
            if guard.is_evicted() {
                debug!("Room '{}' was evicted while connecting, retrying", room_name);
                continue;
            }

            let id = self.reserve_id(&room);
            guard.join(id.clone(), sender.clone());
            return Ok(id);
        }
    }

    /// Overwrite a session's volatile state; peers see it on the next tick
    pub async fn update_volatile(&self, id: &SessionId, state: VolatileState) -> SyncResult<()> {
        let room = self.room_of(id)?;
        let mut room = room.lock().await;
        room.set_volatile(id, state)
    }

    /// Overwrite a session's profile and announce it to the room
    pub async fn update_user(&self, id: &SessionId, user: UserProfile) -> SyncResult<()> {
        let room = self.room_of(id)?;
        let mut room = room.lock().await;
        room.set_user(id, user)
    }

    /// Merge a sync message from a session into its room document
    pub async fn receive_sync(&self, id: &SessionId, bytes: &[u8]) -> SyncResult<()> {
        let room = self.room_of(id)?;
        let mut room = room.lock().await;
        room.receive_sync(id, bytes)
    }

    /// Remove a session from its room and the global table
    pub async fn disconnect(&self, id: &SessionId) -> bool {
        let Ok(room) = self.room_of(id) else {
            return false;
        };
        let mut room = room.lock().await;
        self.sessions.remove(id);
        room.leave(id)
    }

    /// Broadcast poses in every occupied room and evict idle ones
    pub async fn tick(&self) {
        let now = Instant::now();
        for room in self.room_handles() {
            let mut guard = room.lock().await;
            if !guard.is_empty() {
                guard.broadcast_others();
                continue;
            }

            let idle = guard.idle_for(now).unwrap_or_default();
            if idle >= self.idle_ttl && !guard.is_evicted() {
                self.evict(&room, &mut guard, now).await;
            }
        }
    }

    /// Ask clients to reload, in one room or everywhere
    ///
    /// Returns the number of rooms notified.
    pub async fn reload(&self, room_name: Option<&str>) -> usize {
        let rooms = match room_name {
            Some(name) => self
                .rooms
                .get(name)
                .map(|room| vec![room.value().clone()])
                .unwrap_or_default(),
            None => self.room_handles(),
        };

        for room in &rooms {
            let room = room.lock().await;
            info!("Reloading room '{}'", room.name());
            room.broadcast(ServerMessage::Reload, None);
        }
        rooms.len()
    }

    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        let mut summaries = Vec::new();
        for room in self.room_handles() {
            let room = room.lock().await;
            summaries.push(RoomSummary {
                name: room.name().to_string(),
                members: room.len(),
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Archive every dirty room document, returning how many were written
    #[cfg(feature = "persistence")]
    pub async fn archive_dirty(&self) -> usize {
        let mut written = 0;
        for room in self.room_handles() {
            let mut room = room.lock().await;
            if room.document().is_dirty() && self.archive_room(&mut room).await {
                written += 1;
            }
        }
        written
    }

    /// Archive all rooms and drop every session and room
    ///
    /// Dropping the rooms closes each session's outbound channel.
    pub async fn teardown(&self) {
        for room in self.room_handles() {
            let mut guard = room.lock().await;
            #[cfg(feature = "persistence")]
            if guard.document().is_dirty() {
                self.archive_room(&mut guard).await;
            }
            guard.mark_evicted();
        }
        self.sessions.clear();
        self.rooms.clear();
        info!("Session registry torn down");
    }

    fn room_of(&self, id: &SessionId) -> SyncResult<Arc<Mutex<Room>>> {
        self.sessions
            .get(id)
            .map(|room| room.value().clone())
            .ok_or_else(|| SyncError::SessionNotFound { id: id.to_string() })
    }

    fn room_handles(&self) -> Vec<Arc<Mutex<Room>>> {
        self.rooms.iter().map(|room| room.value().clone()).collect()
    }

    /// Draw ids until one is unused and claim it atomically
    fn reserve_id(&self, room: &Arc<Mutex<Room>>) -> SessionId {
        loop {
            let id = self.ids.next_id();
            match self.sessions.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(room.clone());
                    return id;
                }
                Entry::Occupied(_) => debug!("Session id {} already taken, retrying", id),
            }
        }
    }

    /// Drop an idle room unless that would lose scene state
    ///
    /// A bootstrapped scene is only dropped once an archive holds it.
    async fn evict(&self, handle: &Arc<Mutex<Room>>, room: &mut Room, now: Instant) {
        #[cfg(feature = "persistence")]
        if room.document().is_dirty() {
            self.archive_room(room).await;
        }
        let document = room.document();
        if document.is_dirty() && document.tables().created {
            debug!("Keeping idle room '{}' with unarchived scene", room.name());
            room.restart_idle_clock(now);
            return;
        }
        room.mark_evicted();
        self.rooms
            .remove_if(room.name(), |_, current| Arc::ptr_eq(current, handle));
        info!("Evicted idle room '{}'", room.name());
    }

    #[cfg(feature = "persistence")]
    async fn archive_room(&self, room: &mut Room) -> bool {
        let Some(archive) = &self.archive else {
            return false;
        };
        match archive.save(room.name(), &room.document().snapshot()).await {
            Ok(()) => {
                room.document_mut().mark_clean();
                debug!("Archived room '{}'", room.name());
                true
            }
            Err(e) => {
                warn!("Failed to archive room '{}': {}", room.name(), e);
                false
            }
        }
    }

    #[cfg(feature = "persistence")]
    async fn load_snapshot(&self, name: &str) -> Option<Vec<u8>> {
        let archive = self.archive.as_ref()?;
        match archive.load(name).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable archive for room '{}': {}", name, e);
                None
            }
        }
    }

    #[cfg(not(feature = "persistence"))]
    async fn load_snapshot(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    async fn join(
        registry: &SessionRegistry,
        room: &str,
    ) -> (SessionId, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.connect(room, tx).await.unwrap();
        (id, rx)
    }

    fn others_in(messages: &[ServerMessage]) -> Vec<SessionId> {
        messages
            .iter()
            .rev()
            .find_map(|message| match message {
                ServerMessage::Others(others) => {
                    Some(others.iter().map(|peer| peer.id.clone()).collect())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_ids_unique_under_biased_source() {
        // every candidate is produced three times in a row
        let counter = Arc::new(AtomicUsize::new(0));
        let source = {
            let counter = counter.clone();
            move || SessionId::new(format!("id-{}", counter.fetch_add(1, Ordering::SeqCst) / 3))
        };
        let registry = Arc::new(SessionRegistry::new().with_id_source(source));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                registry.connect("/crowd", tx).await.unwrap()
            }));
        }

        let mut ids = std::collections::BTreeSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(registry.session_count(), 16);
    }

    #[tokio::test]
    async fn test_tick_delivers_latest_pose_to_every_other_member() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = join(&registry, "/room").await;
        let (b, mut rx_b) = join(&registry, "/room").await;
        let (c, mut rx_c) = join(&registry, "/room").await;

        let mut pose = VolatileState::default();
        pose.poses[0] = Some(crate::protocol::PoseRecord::at(1.0, 1.6, -2.0));
        registry.update_volatile(&a, pose.clone()).await.unwrap();
        registry.tick().await;

        for (me, rx) in [(&b, &mut rx_b), (&c, &mut rx_c)] {
            let messages = drain(rx);
            let Some(ServerMessage::Others(others)) = messages.last() else {
                panic!("Expected others message");
            };
            assert!(others.iter().all(|peer| &peer.id != me));
            let from_a = others.iter().find(|peer| peer.id == a).unwrap();
            assert_eq!(from_a.state, pose);
        }
        assert_eq!(others_in(&drain(&mut rx_a)).len(), 2);
    }

    #[tokio::test]
    async fn test_lobby_scenario() {
        let mut next = 0;
        let names = std::sync::Mutex::new(std::iter::from_fn(move || {
            next += 1;
            Some(SessionId::new(format!("u{}", next)))
        }));
        let registry = SessionRegistry::new().with_id_source(move || {
            names.lock().unwrap().next().unwrap()
        });

        let (u1, mut rx1) = join(&registry, "lobby").await;
        let messages = drain(&mut rx1);
        assert_eq!(
            messages[0],
            ServerMessage::Handshake {
                id: SessionId::from("u1"),
                others: vec![],
            }
        );
        registry
            .update_user(
                &u1,
                UserProfile {
                    display_name: "Ann".to_string(),
                    color: [1.0, 0.0, 0.0],
                },
            )
            .await
            .unwrap();

        let (u2, mut rx2) = join(&registry, "lobby").await;
        assert_eq!(u2, SessionId::from("u2"));
        let messages = drain(&mut rx2);
        let ServerMessage::Handshake { others, .. } = &messages[0] else {
            panic!("Expected handshake");
        };
        assert_eq!(others[0].user.display_name, "Ann");

        registry.tick().await;
        let messages = drain(&mut rx2);
        let [ServerMessage::Others(others)] = messages.as_slice() else {
            panic!("Expected a single others message, got {:?}", messages);
        };
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, u1);
        assert_eq!(others[0].state, VolatileState::default());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_members() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = join(&registry, "/room").await;
        let (_b, mut rx_b) = join(&registry, "/room").await;
        drain(&mut rx_b);

        assert!(registry.disconnect(&a).await);
        assert!(!registry.disconnect(&a).await);
        assert_eq!(drain(&mut rx_b), vec![ServerMessage::Exit(a.clone())]);
        assert_eq!(registry.session_count(), 1);

        let result = registry.update_volatile(&a, VolatileState::default()).await;
        assert!(matches!(result, Err(SyncError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_idle_rooms_are_evicted_on_tick() {
        let registry = SessionRegistry::new().with_idle_ttl(Duration::ZERO);
        let (a, _rx) = join(&registry, "/empty-soon").await;
        registry.tick().await;
        assert_eq!(registry.room_count(), 1);

        registry.disconnect(&a).await;
        registry.tick().await;
        assert_eq!(registry.room_count(), 0);

        // a later connect recreates it
        let (_b, _rx) = join(&registry, "/empty-soon").await;
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_room_with_unarchived_scene_survives_tick() {
        let registry = SessionRegistry::new().with_idle_ttl(Duration::ZERO);
        let (a, _rx) = join(&registry, "/workshop").await;
        let handle = registry.rooms.get("/workshop").unwrap().value().clone();
        handle
            .lock()
            .await
            .document_mut()
            .apply_change("create tables", |draft| {
                draft.create_tables();
                draft.insert_root("scene");
                Ok(())
            })
            .unwrap();
        let snapshot = handle.lock().await.document().snapshot();

        registry.disconnect(&a).await;
        registry.tick().await;
        registry.tick().await;
        assert_eq!(registry.room_count(), 1);

        let (_b, _rx) = join(&registry, "/workshop").await;
        let room = registry.rooms.get("/workshop").unwrap().value().clone();
        assert!(Arc::ptr_eq(&room, &handle));
        assert_eq!(room.lock().await.document().snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_reload_targets_one_room_or_all() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = join(&registry, "/a").await;
        let (_b, mut rx_b) = join(&registry, "/b").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(registry.reload(Some("/a")).await, 1);
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::Reload]);
        assert!(drain(&mut rx_b).is_empty());

        assert_eq!(registry.reload(None).await, 2);
        assert_eq!(registry.reload(Some("/missing")).await, 0);

        let summaries = registry.room_summaries().await;
        assert_eq!(
            summaries,
            vec![
                RoomSummary { name: "/a".to_string(), members: 1 },
                RoomSummary { name: "/b".to_string(), members: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_teardown_closes_session_channels() {
        let registry = SessionRegistry::new();
        let (_a, mut rx) = join(&registry, "/room").await;
        drain(&mut rx);

        registry.teardown().await;
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.room_count(), 0);
        assert!(rx.recv().await.is_none());
    }
}
