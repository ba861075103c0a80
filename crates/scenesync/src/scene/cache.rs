use std::collections::HashMap;
use std::sync::Arc;

use super::graph::NodeId;
use crate::document::{GeometryRow, MaterialRow, RowId};

/// Local handle for a document row
#[derive(Debug, Clone, PartialEq)]
pub enum CachedEntry {
    Mesh(NodeId),
    Geometry(Arc<GeometryRow>),
    Material(Arc<MaterialRow>),
}

/// Row id to local handle lookup
#[derive(Debug, Clone, Default)]
pub struct ObjectCache {
    entries: HashMap<RowId, CachedEntry>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: RowId, entry: CachedEntry) -> Option<CachedEntry> {
        self.entries.insert(id, entry)
    }

    pub fn get(&self, id: &str) -> Option<&CachedEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<CachedEntry> {
        self.entries.remove(id)
    }

    pub fn node(&self, id: &str) -> Option<NodeId> {
        match self.entries.get(id) {
            Some(CachedEntry::Mesh(node)) => Some(*node),
            _ => None,
        }
    }

    pub fn geometry(&self, id: &str) -> Option<Arc<GeometryRow>> {
        match self.entries.get(id) {
            Some(CachedEntry::Geometry(geometry)) => Some(geometry.clone()),
            _ => None,
        }
    }

    pub fn material(&self, id: &str) -> Option<Arc<MaterialRow>> {
        match self.entries.get(id) {
            Some(CachedEntry::Material(material)) => Some(material.clone()),
            _ => None,
        }
    }

    /// Row id bound to a graph node
    pub fn row_of(&self, node: NodeId) -> Option<&RowId> {
        self.entries
            .iter()
            .find(|(_, entry)| matches!(entry, CachedEntry::Mesh(n) if *n == node))
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
