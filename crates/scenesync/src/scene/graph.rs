use std::collections::HashMap;
use std::sync::Arc;

use crate::document::{GeometryRow, MaterialRow, RowId};

/// Handle of a node in a [`SceneGraph`]
pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: [f64; 3],
    pub quaternion: [f64; 4],
    pub scale: [f64; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            quaternion: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }
}

/// Renderable payload bound to a node
#[derive(Debug, Clone, PartialEq)]
pub struct MeshBinding {
    pub geometry_id: RowId,
    pub geometry: Arc<GeometryRow>,
    pub material_id: RowId,
    pub material: Arc<MaterialRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub transform: Transform,
    pub mesh: Option<MeshBinding>,
    /// Document row this node mirrors
    pub row_id: Option<RowId>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            children: Vec::new(),
            transform: Transform::default(),
            mesh: None,
            row_id: None,
        }
    }
}

/// Local object graph the renderer consumes
///
/// Nodes live in an arena keyed by [`NodeId`]. A node without a parent is
/// detached and not part of the visible scene, except for the root.
#[derive(Debug, Clone)]
pub struct SceneGraph {
    nodes: HashMap<NodeId, SceneNode>,
    root: NodeId,
    next_id: NodeId,
}

impl SceneGraph {
    pub fn new(root_name: impl Into<String>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(0, SceneNode::new(root_name));
        Self {
            nodes,
            root: 0,
            next_id: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&SceneNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        self.nodes.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a detached node
    pub fn insert(&mut self, mut node: SceneNode) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        node.parent = None;
        node.children.clear();
        self.nodes.insert(id, node);
        id
    }

    /// Move `child` under `parent`
    ///
    /// Returns false if either node is missing or the move would create a
    /// cycle.
    pub fn attach(&mut self, child: NodeId, parent: NodeId) -> bool {
        if child == self.root || !self.nodes.contains_key(&child) {
            return false;
        }
        if !self.nodes.contains_key(&parent) || self.is_ancestor(child, parent) {
            return false;
        }

        self.detach(child);
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(child);
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        true
    }

    /// Unlink `child` from its parent, keeping it in the arena
    pub fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.nodes.get_mut(&child).and_then(|node| node.parent.take()) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.retain(|&c| c != child);
        }
    }

    /// Drop a node; its children become detached
    pub fn remove(&mut self, id: NodeId) -> Option<SceneNode> {
        if id == self.root {
            return None;
        }
        self.detach(id);
        let node = self.nodes.remove(&id)?;
        for child in &node.children {
            if let Some(child) = self.nodes.get_mut(child) {
                child.parent = None;
            }
        }
        Some(node)
    }

    /// True if `ancestor` is `node` or lies on its parent chain
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }
        false
    }

    /// Whether the node is reachable from the root
    pub fn is_attached(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id) && self.is_ancestor(self.root, id)
    }

    /// Replace the geometry of every mesh bound to `geometry_id`
    pub fn rebind_geometry(&mut self, geometry_id: &str, geometry: &Arc<GeometryRow>) {
        for mesh in self.nodes.values_mut().filter_map(|n| n.mesh.as_mut()) {
            if mesh.geometry_id == geometry_id {
                mesh.geometry = geometry.clone();
            }
        }
    }

    /// Replace the material of every mesh bound to `material_id`
    pub fn rebind_material(&mut self, material_id: &str, material: &Arc<MaterialRow>) {
        for mesh in self.nodes.values_mut().filter_map(|n| n.mesh.as_mut()) {
            if mesh.material_id == material_id {
                mesh.material = material.clone();
            }
        }
    }
}
