//! Scene reconciler: turns document patches into a live object graph and
//! local edits back into document changes.

pub mod cache;
pub mod graph;
pub mod reconciler;

pub use cache::{CachedEntry, ObjectCache};
pub use graph::{MeshBinding, NodeId, SceneGraph, SceneNode, Transform};
pub use reconciler::{SharedScene, SyncPhase, RELAY_PEER};
