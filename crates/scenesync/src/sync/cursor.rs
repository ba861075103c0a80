use yrs::StateVector;

use super::{dominates, equivalent, merged, SyncMessage};

/// Progress marker for the conversation with one remote peer
///
/// A cursor belongs to exactly one (document, peer) pair. Reusing it for a
/// different peer breaks the minimal-delta computation.
#[derive(Debug, Clone, Default)]
pub struct PeerCursor {
    /// Best known version vector of the peer
    their_state: Option<StateVector>,
    /// Our version vector as of the last message we sent
    sent_state: Option<StateVector>,
    /// The peer's view of our state is stale and must be refreshed
    ack_pending: bool,
    sent: u64,
    received: u64,
}

impl PeerCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next message for this peer, or `None` if it is caught up.
    ///
    /// `diff` encodes every operation missing from the given remote state.
    pub fn generate<F>(&mut self, ours: &StateVector, diff: F) -> Option<SyncMessage>
    where
        F: FnOnce(&StateVector) -> Vec<u8>,
    {
        let missing = self
            .their_state
            .as_ref()
            .filter(|theirs| !dominates(theirs, ours));
        let advertised = self
            .sent_state
            .as_ref()
            .is_some_and(|sent| equivalent(sent, ours));
        let peer_current = self
            .their_state
            .as_ref()
            .is_some_and(|theirs| equivalent(theirs, ours));

        if missing.is_none() && !self.ack_pending && (advertised || peer_current) {
            return None;
        }

        let update = missing.map(diff);
        let message = SyncMessage {
            state: ours.clone(),
            known: self.their_state.clone(),
            update,
        };

        // ordered transport: assume the peer integrates what we just sent
        if message.update.is_some() {
            self.their_state = Some(match &self.their_state {
                Some(theirs) => merged(theirs, ours),
                None => ours.clone(),
            });
        }
        self.sent_state = Some(ours.clone());
        self.ack_pending = false;
        self.sent += 1;

        Some(message)
    }

    /// Record a message from the peer after its update has been applied.
    ///
    /// `ours` is the local version vector after integration.
    pub fn observe(&mut self, message: &SyncMessage, ours: &StateVector) {
        self.their_state = Some(match &self.their_state {
            Some(theirs) => merged(theirs, &message.state),
            None => message.state.clone(),
        });

        // the sender assumes we integrated its update, mirror that here
        let belief = match (&message.known, message.update.is_some()) {
            (Some(known), true) => Some(merged(known, &message.state)),
            (None, true) => Some(message.state.clone()),
            (known, false) => known.clone(),
        };
        self.ack_pending = !belief.is_some_and(|belief| equivalent(&belief, ours));
        self.received += 1;
    }

    pub fn their_state(&self) -> Option<&StateVector> {
        self.their_state.as_ref()
    }

    /// Number of messages generated for this peer
    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    /// Number of messages received from this peer
    pub fn received_count(&self) -> u64 {
        self.received
    }
}
