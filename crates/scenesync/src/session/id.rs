use uuid::Uuid;

use crate::protocol::SessionId;

/// Source of candidate session ids
///
/// Candidates may collide; the registry retries until it reserves an unused
/// one.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> SessionId;
}

/// Random 128-bit ids
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidSource;

impl IdSource for UuidSource {
    fn next_id(&self) -> SessionId {
        SessionId::new(Uuid::new_v4().to_string())
    }
}

impl<F> IdSource for F
where
    F: Fn() -> SessionId + Send + Sync,
{
    fn next_id(&self) -> SessionId {
        self()
    }
}
