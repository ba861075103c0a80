use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::document::ReplicatedDocument;
use crate::protocol::{
    PeerSummary, PeerVolatile, ServerMessage, SessionId, UserProfile, VolatileState,
};
use crate::{SyncError, SyncResult};

/// Actor id of the relay's replica in every room
pub const RELAY_ACTOR: &str = "server";

struct Member {
    sender: UnboundedSender<ServerMessage>,
    volatile: VolatileState,
    user: UserProfile,
}

/// A named group of sessions sharing one scene document
pub struct Room {
    name: String,
    members: BTreeMap<SessionId, Member>,
    document: ReplicatedDocument,
    empty_since: Option<Instant>,
    evicted: bool,
}

impl Room {
    pub(crate) fn new(name: impl Into<String>, snapshot: Option<&[u8]>) -> SyncResult<Self> {
        Ok(Self {
            name: name.into(),
            members: BTreeMap::new(),
            document: ReplicatedDocument::new(snapshot, RELAY_ACTOR)?,
            empty_since: Some(Instant::now()),
            evicted: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &SessionId> {
        self.members.keys()
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.document
    }

    pub(crate) fn document_mut(&mut self) -> &mut ReplicatedDocument {
        &mut self.document
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    /// How long the room has had no members
    pub(crate) fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.empty_since.map(|since| now.saturating_duration_since(since))
    }

    pub(crate) fn restart_idle_clock(&mut self, now: Instant) {
        if self.empty_since.is_some() {
            self.empty_since = Some(now);
        }
    }

    /// Register a member and queue its handshake and the document snapshot
    pub(crate) fn join(&mut self, id: SessionId, sender: UnboundedSender<ServerMessage>) {
        let others = self
            .members
            .iter()
            .map(|(other, member)| PeerSummary {
                volatile: PeerVolatile {
                    id: other.clone(),
                    state: member.volatile.clone(),
                },
                user: member.user.clone(),
            })
            .collect();

        self.document.add_peer(id.as_str());
        self.members.insert(
            id.clone(),
            Member {
                sender,
                volatile: VolatileState::default(),
                user: UserProfile::default(),
            },
        );
        self.empty_since = None;

        self.send(&id, ServerMessage::Handshake {
            id: id.clone(),
            others,
        });
        self.send(&id, ServerMessage::Project(self.document.snapshot()));
        info!("Session {} joined room '{}' ({} members)", id, self.name, self.len());
    }

    /// Remove a member and tell the rest; returns false if it was not here
    pub(crate) fn leave(&mut self, id: &SessionId) -> bool {
        if self.members.remove(id).is_none() {
            return false;
        }
        self.document.remove_peer(id.as_str());
        if self.members.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        self.broadcast(ServerMessage::Exit(id.clone()), None);
        info!("Session {} left room '{}' ({} members)", id, self.name, self.len());
        true
    }

    pub(crate) fn set_volatile(&mut self, id: &SessionId, state: VolatileState) -> SyncResult<()> {
        self.member_mut(id)?.volatile = state;
        Ok(())
    }

    pub(crate) fn set_user(&mut self, id: &SessionId, user: UserProfile) -> SyncResult<()> {
        self.member_mut(id)?.user = user.clone();
        self.broadcast(
            ServerMessage::User {
                id: id.clone(),
                user,
            },
            Some(id),
        );
        Ok(())
    }

    /// Merge a member's sync message and answer every member that is behind
    pub(crate) fn receive_sync(&mut self, id: &SessionId, bytes: &[u8]) -> SyncResult<()> {
        if let Some(patch) = self.document.receive_sync_message(bytes, id.as_str())? {
            debug!(
                "Room '{}' merged {} row changes from {}",
                self.name,
                patch.len(),
                id
            );
        }
        self.flush_sync();
        Ok(())
    }

    /// Send each member its outstanding sync message, if any
    pub(crate) fn flush_sync(&mut self) {
        let ids: Vec<SessionId> = self.members.keys().cloned().collect();
        for id in ids {
            match self.document.generate_sync_message(id.as_str()) {
                Ok(Some(bytes)) => self.send(&id, ServerMessage::Sync(bytes)),
                Ok(None) => {}
                Err(e) => warn!("Room '{}' cannot sync {}: {}", self.name, id, e),
            }
        }
    }

    /// Send every member the volatile state of all the others
    pub(crate) fn broadcast_others(&self) {
        for recipient in self.members.keys() {
            let others = self
                .members
                .iter()
                .filter(|(id, _)| *id != recipient)
                .map(|(id, member)| PeerVolatile {
                    id: id.clone(),
                    state: member.volatile.clone(),
                })
                .collect();
            self.send(recipient, ServerMessage::Others(others));
        }
    }

    pub(crate) fn broadcast(&self, message: ServerMessage, except: Option<&SessionId>) {
        for id in self.members.keys() {
            if Some(id) != except {
                self.send(id, message.clone());
            }
        }
    }

    fn send(&self, id: &SessionId, message: ServerMessage) {
        let Some(member) = self.members.get(id) else {
            return;
        };
        let cmd = message.cmd();
        if member.sender.send(message).is_err() {
            warn!("Failed to queue '{}' for session {}", cmd, id);
        }
    }

    fn member_mut(&mut self, id: &SessionId) -> SyncResult<&mut Member> {
        self.members
            .get_mut(id)
            .ok_or_else(|| SyncError::SessionNotFound { id: id.to_string() })
    }
}
