//! Sync transport: the message format and per-peer cursor bookkeeping that
//! drive a replicated document toward convergence with each remote peer.

pub mod cursor;
pub mod message;

pub use cursor::PeerCursor;
pub use message::SyncMessage;

use yrs::StateVector;

/// True when `a` has seen every operation `b` has seen
pub fn dominates(a: &StateVector, b: &StateVector) -> bool {
    b.iter().all(|(client, clock)| a.get(client) >= *clock)
}

/// True when both vectors describe the same set of operations
pub fn equivalent(a: &StateVector, b: &StateVector) -> bool {
    dominates(a, b) && dominates(b, a)
}

/// Pointwise maximum of two version vectors
pub fn merged(a: &StateVector, b: &StateVector) -> StateVector {
    let mut out = a.clone();
    for (client, clock) in b.iter() {
        out.set_max(*client, *clock);
    }
    out
}
