use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::tables::{Draft, SceneMaps, SceneTables};
use super::Patch;
use crate::sync::{PeerCursor, SyncMessage};
use crate::{SyncError, SyncResult};

const CHANGE_LOG_CAPACITY: usize = 256;

/// Entry in the local change log
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub description: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// One replica of the shared scene document
///
/// Wraps the CRDT document with typed table access, one sync cursor per
/// remote peer, and dirty tracking for persistence.
pub struct ReplicatedDocument {
    doc: Doc,
    maps: SceneMaps,
    actor: String,
    peers: HashMap<String, PeerCursor>,
    tables: SceneTables,
    dirty: bool,
    last_modified: Instant,
    log: VecDeque<ChangeRecord>,
}

impl ReplicatedDocument {
    /// Create an empty replica, or one seeded from a snapshot
    pub fn new(snapshot: Option<&[u8]>, actor: impl Into<String>) -> SyncResult<Self> {
        let doc = Doc::new();
        let maps = SceneMaps::new(&doc);
        if let Some(snapshot) = snapshot {
            apply_update(&doc, snapshot)?;
        }
        let tables = maps.read(&doc.transact());

        Ok(Self {
            doc,
            maps,
            actor: actor.into(),
            peers: HashMap::new(),
            tables,
            dirty: false,
            last_modified: Instant::now(),
            log: VecDeque::new(),
        })
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Start (or restart) the sync conversation with a peer
    pub fn add_peer(&mut self, peer: impl Into<String>) {
        let peer = peer.into();
        debug!("Sync cursor reset for peer '{}' on '{}'", peer, self.actor);
        self.peers.insert(peer, PeerCursor::new());
    }

    pub fn remove_peer(&mut self, peer: &str) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn has_peer(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Run `mutator` against a draft and commit its writes as one change
    ///
    /// If the mutator fails nothing is written.
    pub fn apply_change<R, F>(&mut self, description: &str, mutator: F) -> SyncResult<R>
    where
        F: FnOnce(&mut Draft<'_>) -> SyncResult<R>,
    {
        let mut draft = Draft::new(&self.tables);
        let result = mutator(&mut draft)?;
        if draft.is_empty() {
            return Ok(result);
        }

        {
            let mut txn = self.doc.transact_mut();
            draft.commit(&self.maps, &mut txn)?;
        }
        self.refresh_tables();
        self.record(description, self.actor.clone());
        Ok(result)
    }

    /// Merge a sync message from `peer`
    ///
    /// Returns the rows that changed, or `None` if nothing visible did.
    pub fn receive_sync_message(&mut self, bytes: &[u8], peer: &str) -> SyncResult<Option<Patch>> {
        if !self.peers.contains_key(peer) {
            return Err(SyncError::Convergence {
                peer: peer.to_string(),
            });
        }
        let message = SyncMessage::decode(bytes)?;

        let patch = match &message.update {
            Some(update) => {
                apply_update(&self.doc, update)?;
                let before = self.refresh_tables();
                let patch = Patch::between(&before, &self.tables);
                if patch.is_empty() {
                    None
                } else {
                    self.record(&format!("merge {} row changes", patch.len()), peer.to_string());
                    Some(patch)
                }
            }
            None => None,
        };

        let ours = self.state_vector();
        if let Some(cursor) = self.peers.get_mut(peer) {
            cursor.observe(&message, &ours);
        }
        Ok(patch)
    }

    /// Next outstanding message for `peer`, or `None` when it is caught up
    pub fn generate_sync_message(&mut self, peer: &str) -> SyncResult<Option<Vec<u8>>> {
        let ours = self.state_vector();
        let doc = &self.doc;
        let cursor = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| SyncError::Convergence {
                peer: peer.to_string(),
            })?;

        let message = cursor.generate(&ours, |theirs| doc.transact().encode_diff_v1(theirs));
        Ok(message.map(|message| message.encode()))
    }

    /// Full document state as a single update
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Materialized view of the current state
    pub fn tables(&self) -> &SceneTables {
        &self.tables
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Check if the document changed since it was last archived
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn last_modified(&self) -> Instant {
        self.last_modified
    }

    /// Most recent changes, oldest first
    pub fn change_log(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.log.iter()
    }

    /// Re-read the tables, returning the previous view
    fn refresh_tables(&mut self) -> SceneTables {
        let fresh = self.maps.read(&self.doc.transact());
        std::mem::replace(&mut self.tables, fresh)
    }

    fn record(&mut self, description: &str, actor: String) {
        info!("Change '{}' by '{}' on '{}'", description, actor, self.actor);
        if self.log.len() == CHANGE_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(ChangeRecord {
            description: description.to_string(),
            actor,
            at: Utc::now(),
        });
        self.dirty = true;
        self.last_modified = Instant::now();
    }
}

fn apply_update(doc: &Doc, bytes: &[u8]) -> SyncResult<()> {
    let update =
        Update::decode_v1(bytes).map_err(|e| SyncError::Crdt(format!("Undecodable update: {}", e)))?;
    doc.transact_mut()
        .apply_update(update)
        .map_err(|e| SyncError::Crdt(format!("Failed to apply update: {}", e)))
}
