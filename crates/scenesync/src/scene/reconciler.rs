use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::{CachedEntry, ObjectCache};
use super::graph::{MeshBinding, NodeId, SceneGraph, SceneNode, Transform};
use crate::document::{
    Draft, GeometryRow, MaterialRow, ObjectDelta, ObjectRow, Patch, ReplicatedDocument, RowChange,
    RowId, SceneTables,
};
use crate::{SyncError, SyncResult};

/// Peer name of the relay on a client replica
pub const RELAY_PEER: &str = "relay";

/// Progress of the first sync against the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Unsynced,
    Syncing,
    Synced,
}

/// Client-side replica of a room scene plus its live object graph
///
/// Incoming patches are turned into graph mutations; local edits are written
/// to the document and mirrored into the graph the same way.
pub struct SharedScene {
    document: ReplicatedDocument,
    graph: SceneGraph,
    cache: ObjectCache,
    phase: SyncPhase,
    root_row: Option<RowId>,
    /// Objects waiting for their parent to appear, keyed by row id
    orphans: BTreeMap<RowId, RowId>,
}

impl SharedScene {
    pub fn new(actor: impl Into<String>) -> SyncResult<Self> {
        Self::build(None, actor)
    }

    /// Seed the replica from a full document snapshot
    pub fn from_snapshot(snapshot: &[u8], actor: impl Into<String>) -> SyncResult<Self> {
        Self::build(Some(snapshot), actor)
    }

    fn build(snapshot: Option<&[u8]>, actor: impl Into<String>) -> SyncResult<Self> {
        let mut document = ReplicatedDocument::new(snapshot, actor)?;
        document.add_peer(RELAY_PEER);

        let mut scene = Self {
            document,
            graph: SceneGraph::new("scene"),
            cache: ObjectCache::new(),
            phase: SyncPhase::Unsynced,
            root_row: None,
            orphans: BTreeMap::new(),
        };
        let initial = Patch::between(&SceneTables::default(), scene.document.tables());
        scene.apply_patch(&initial);
        Ok(scene)
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_synced(&self) -> bool {
        self.phase == SyncPhase::Synced
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.document
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Row bound to the local scene root, once bootstrapped
    pub fn root_row(&self) -> Option<&RowId> {
        self.root_row.as_ref()
    }

    /// Graph node mirroring an object row
    pub fn node_for(&self, row: &str) -> Option<NodeId> {
        self.cache.node(row)
    }

    /// Objects still waiting for their parent
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Restart the conversation with the relay, e.g. after reconnecting
    pub fn reset_relay(&mut self) {
        self.document.add_peer(RELAY_PEER);
        if self.phase == SyncPhase::Syncing {
            self.phase = SyncPhase::Unsynced;
        }
    }

    /// Next message for the relay, or `None` if it has everything
    pub fn generate_sync(&mut self) -> SyncResult<Option<Vec<u8>>> {
        let message = self.document.generate_sync_message(RELAY_PEER)?;
        if message.is_some() && self.phase == SyncPhase::Unsynced {
            self.phase = SyncPhase::Syncing;
        }
        Ok(message)
    }

    /// Merge a sync message from the relay and return the reply, if any
    ///
    /// The first time the relay has nothing further to send after a merge,
    /// the scene root is bootstrapped.
    pub fn receive_sync(&mut self, bytes: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        if self.phase == SyncPhase::Unsynced {
            self.phase = SyncPhase::Syncing;
        }
        if let Some(patch) = self.document.receive_sync_message(bytes, RELAY_PEER)? {
            self.apply_patch(&patch);
        }

        let reply = self.document.generate_sync_message(RELAY_PEER)?;
        if reply.is_none() && self.phase == SyncPhase::Syncing {
            self.phase = SyncPhase::Synced;
            self.bootstrap()?;
            return self.document.generate_sync_message(RELAY_PEER);
        }
        Ok(reply)
    }

    /// Create the tables or bind to the existing root
    pub(crate) fn bootstrap(&mut self) -> SyncResult<()> {
        if !self.document.tables().created {
            info!("Creating scene tables on '{}'", self.document.actor());
            self.change("create scene", |draft| {
                draft.create_tables();
                draft.insert_root("scene");
                Ok(())
            })?;
        } else if self.document.tables().root().is_none() {
            warn!("Scene tables exist without a root, inserting one");
            self.change("insert scene root", |draft| {
                draft.insert_root("scene");
                Ok(())
            })?;
        }

        if let Some(root) = self.document.tables().root().cloned() {
            debug!("Binding scene root to row '{}'", root);
            self.cache
                .insert(root.clone(), CachedEntry::Mesh(self.graph.root()));
            if let Some(node) = self.graph.get_mut(self.graph.root()) {
                node.row_id = Some(root.clone());
            }
            self.root_row = Some(root);
        }
        self.wire_orphans();
        Ok(())
    }

    /// Register a geometry and return its row id
    pub fn register_geometry(&mut self, geometry: GeometryRow) -> SyncResult<RowId> {
        let label = format!("add geometry {}", geometry.name);
        self.change(&label, |draft| draft.insert_geometry(geometry))
    }

    /// Register a material and return its row id
    pub fn register_material(&mut self, material: MaterialRow) -> SyncResult<RowId> {
        let label = format!("add material {}", material.name);
        self.change(&label, |draft| Ok(draft.insert_material(material)))
    }

    /// Create a mesh; `parent` defaults to the scene root
    pub fn add_mesh(
        &mut self,
        name: &str,
        parent: Option<RowId>,
        geometry: RowId,
        material: RowId,
        position: [f64; 3],
    ) -> SyncResult<RowId> {
        let parent = parent.or_else(|| self.root_row.clone());
        let row = ObjectRow::mesh(name, parent, geometry, material, position);
        self.change(&format!("add mesh {}", name), |draft| draft.insert_object(row))
    }

    pub fn move_object(&mut self, id: &str, position: [f64; 3]) -> SyncResult<()> {
        self.change(&format!("move {}", id), |draft| {
            draft.update_object(id, |row| row.position = Some(position))
        })
    }

    pub fn rotate_object(&mut self, id: &str, quaternion: [f64; 4]) -> SyncResult<()> {
        self.change(&format!("rotate {}", id), |draft| {
            draft.update_object(id, |row| row.quaternion = Some(quaternion))
        })
    }

    pub fn scale_object(&mut self, id: &str, scale: [f64; 3]) -> SyncResult<()> {
        self.change(&format!("scale {}", id), |draft| {
            draft.update_object(id, |row| row.scale = Some(scale))
        })
    }

    pub fn reparent(&mut self, id: &str, parent: &str) -> SyncResult<()> {
        self.change(&format!("reparent {} under {}", id, parent), |draft| {
            draft.update_object(id, |row| row.parent_id = Some(parent.to_string()))
        })
    }

    pub fn delete_object(&mut self, id: &str) -> SyncResult<()> {
        if self.root_row.as_deref() == Some(id) {
            return Err(SyncError::integrity("The scene root cannot be deleted"));
        }
        self.change(&format!("delete {}", id), |draft| draft.remove_object(id))
    }

    /// Commit a local change and mirror it into the graph
    fn change<R, F>(&mut self, label: &str, mutator: F) -> SyncResult<R>
    where
        F: FnOnce(&mut Draft<'_>) -> SyncResult<R>,
    {
        let before = self.document.tables().clone();
        let result = self.document.apply_change(label, mutator)?;
        let patch = Patch::between(&before, self.document.tables());
        self.apply_patch(&patch);
        Ok(result)
    }

    /// Apply a patch in dependency order: geometries, materials, objects
    pub fn apply_patch(&mut self, patch: &Patch) {
        for change in &patch.geometries {
            self.apply_geometry(change);
        }
        for change in &patch.materials {
            self.apply_material(change);
        }
        for change in &patch.objects {
            if let Err(e) = self.apply_object(change) {
                warn!("Object '{}' not fully applied: {}", change.id(), e);
            }
        }
        self.wire_orphans();
    }

    fn apply_geometry(&mut self, change: &RowChange<GeometryRow, GeometryRow>) {
        match change {
            RowChange::Inserted { id, row } | RowChange::Updated { id, change: row } => {
                if let Err(e) = row.validate() {
                    warn!("Skipping geometry '{}': {}", id, e);
                    return;
                }
                let geometry = Arc::new(row.clone());
                self.graph.rebind_geometry(id, &geometry);
                self.cache.insert(id.clone(), CachedEntry::Geometry(geometry));
            }
            RowChange::Removed { id } => {
                self.cache.remove(id);
            }
        }
    }

    fn apply_material(&mut self, change: &RowChange<MaterialRow, MaterialRow>) {
        match change {
            RowChange::Inserted { id, row } | RowChange::Updated { id, change: row } => {
                let material = Arc::new(row.clone());
                self.graph.rebind_material(id, &material);
                self.cache.insert(id.clone(), CachedEntry::Material(material));
            }
            RowChange::Removed { id } => {
                self.cache.remove(id);
            }
        }
    }

    fn apply_object(&mut self, change: &RowChange<ObjectRow, ObjectDelta>) -> SyncResult<()> {
        match change {
            RowChange::Inserted { id, row } => self.insert_node(id, row),
            RowChange::Updated { id, change } => match self.cache.node(id) {
                Some(node) => self.update_node(id, node, change),
                // never materialized, build it from the full row
                None => match self.document.tables().objects.get(id).cloned() {
                    Some(row) => self.insert_node(id, &row),
                    None => Ok(()),
                },
            },
            RowChange::Removed { id } => {
                self.remove_node(id);
                Ok(())
            }
        }
    }

    fn insert_node(&mut self, id: &RowId, row: &ObjectRow) -> SyncResult<()> {
        if row.is_root() {
            // bound during bootstrap
            return Ok(());
        }
        let mesh = self.resolve_mesh(row.geometry_id.as_ref(), row.material_id.as_ref())?;
        self.remove_node(id);

        let mut node = SceneNode::new(row.name.clone());
        node.transform = transform_of(row);
        node.mesh = mesh;
        node.row_id = Some(id.clone());
        let node = self.graph.insert(node);
        self.cache.insert(id.clone(), CachedEntry::Mesh(node));
        self.place(id, node, row.parent_id.as_ref());
        Ok(())
    }

    fn update_node(&mut self, id: &RowId, node: NodeId, delta: &ObjectDelta) -> SyncResult<()> {
        if let Some(target) = self.graph.get_mut(node) {
            if let Some(name) = &delta.name {
                target.name = name.clone();
            }
            let transform = &mut target.transform;
            ObjectDelta::apply_components(&mut transform.position, &delta.position);
            ObjectDelta::apply_components(&mut transform.quaternion, &delta.quaternion);
            ObjectDelta::apply_components(&mut transform.scale, &delta.scale);
        }

        if let Some(parent) = &delta.parent_id {
            self.place(id, node, parent.as_ref());
        }

        // an unresolvable rebind keeps the previous mesh
        if delta.geometry_id.is_some() || delta.material_id.is_some() {
            let row = self
                .document
                .tables()
                .objects
                .get(id)
                .cloned()
                .unwrap_or_default();
            let mesh = self.resolve_mesh(row.geometry_id.as_ref(), row.material_id.as_ref())?;
            if let Some(target) = self.graph.get_mut(node) {
                target.mesh = mesh;
            }
        }
        Ok(())
    }

    fn remove_node(&mut self, id: &str) {
        self.orphans.remove(id);
        if let Some(node) = self.cache.node(id) {
            if node == self.graph.root() {
                return;
            }
            self.cache.remove(id);
            self.graph.remove(node);
            debug!("Removed node for row '{}'", id);
        }
    }

    /// Attach a node under its parent row, or queue it until that row appears
    fn place(&mut self, id: &RowId, node: NodeId, parent: Option<&RowId>) {
        let parent_node = match parent {
            None => Some(self.graph.root()),
            Some(parent) => self.cache.node(parent),
        };
        match parent_node {
            Some(parent_node) if self.graph.attach(node, parent_node) => {
                self.orphans.remove(id);
            }
            Some(_) => {
                warn!("Refusing to attach '{}' in a cycle", id);
                self.graph.detach(node);
            }
            None => {
                self.graph.detach(node);
                if let Some(parent) = parent {
                    self.orphans.insert(id.clone(), parent.clone());
                }
            }
        }
    }

    fn wire_orphans(&mut self) {
        let ready: Vec<(RowId, RowId)> = self
            .orphans
            .iter()
            .filter(|(_, parent)| self.cache.node(parent).is_some())
            .map(|(child, parent)| (child.clone(), parent.clone()))
            .collect();

        for (child, parent) in ready {
            if let Some(node) = self.cache.node(&child) {
                self.place(&child, node, Some(&parent));
            } else {
                self.orphans.remove(&child);
            }
        }
    }

    fn resolve_mesh(
        &self,
        geometry_id: Option<&RowId>,
        material_id: Option<&RowId>,
    ) -> SyncResult<Option<MeshBinding>> {
        let (geometry_id, material_id) = match (geometry_id, material_id) {
            (Some(geometry_id), Some(material_id)) => (geometry_id, material_id),
            (None, None) => return Ok(None),
            _ => {
                return Err(SyncError::integrity(
                    "Mesh needs both a geometry and a material",
                ))
            }
        };
        let geometry = self.cache.geometry(geometry_id).ok_or_else(|| {
            SyncError::integrity(format!("Unknown geometry '{}'", geometry_id))
        })?;
        let material = self.cache.material(material_id).ok_or_else(|| {
            SyncError::integrity(format!("Unknown material '{}'", material_id))
        })?;
        Ok(Some(MeshBinding {
            geometry_id: geometry_id.clone(),
            geometry,
            material_id: material_id.clone(),
            material,
        }))
    }
}

fn transform_of(row: &ObjectRow) -> Transform {
    let identity = Transform::default();
    Transform {
        position: row.position.unwrap_or(identity.position),
        quaternion: row.quaternion.unwrap_or(identity.quaternion),
        scale: row.scale.unwrap_or(identity.scale),
    }
}
