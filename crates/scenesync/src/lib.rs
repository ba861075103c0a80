//! # scenesync - shared 3D scene relay
//!
//! Room-based session relay for collaborative 3D scenes. Clients connecting to
//! the same room see each other's head and controller poses at a fixed tick
//! rate and edit one replicated scene document (objects, geometries,
//! materials) that converges on every peer.
//!
//! The relay side is [`SessionRegistry`] plus the axum surface in [`axum`].
//! The client side is [`SharedScene`], which mirrors the document into a
//! [`SceneGraph`], and the headless driver in [`client`].

pub mod config;
pub mod document;
pub mod error;
pub mod protocol;
pub mod scene;
pub mod session;
pub mod sync;

#[cfg(feature = "persistence")]
pub mod persistence;

#[cfg(feature = "axum")]
pub mod axum;

#[cfg(feature = "client")]
pub mod client;

// Re-exports for convenience
pub use config::RelayConfig;
pub use document::{
    GeometryRow, MaterialRow, ObjectRow, Patch, ReplicatedDocument, RowChange, RowId,
    SceneTables,
};
pub use error::{SyncError, SyncResult};
pub use protocol::{ClientMessage, PoseRecord, ServerMessage, SessionId, UserProfile, VolatileState};
pub use scene::{SceneGraph, SharedScene, SyncPhase};
pub use session::{normalize_room_name, SessionRegistry};
pub use sync::{PeerCursor, SyncMessage};

#[cfg(feature = "axum")]
pub use crate::axum::{router, RelayState, WebSocketHandler};

#[cfg(feature = "client")]
pub use client::{ClientEvent, ClientSession, RelayClient};

#[cfg(feature = "persistence")]
pub use persistence::{PersistenceManager, RoomArchive};
