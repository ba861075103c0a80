//! Session registry: connected clients, room membership, volatile pose state
//! and the periodic broadcast that fans it out.

pub mod id;
pub mod registry;
pub mod room;

pub use id::{IdSource, UuidSource};
pub use registry::{RoomSummary, SessionRegistry, DEFAULT_IDLE_TTL};
pub use room::{Room, RELAY_ACTOR};

/// Canonical room name for a request path
///
/// Repeated slashes collapse, trailing slashes are dropped and the empty path
/// becomes `/`.
pub fn normalize_room_name(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}
