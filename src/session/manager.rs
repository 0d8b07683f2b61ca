use super::{Session, SessionId, EXPIRY_FACTOR};
use crate::raft::SessionAck;

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

/// The set of live sessions on a replica. Part of the replicated state: all
/// mutations happen while applying log entries, so every replica holds the
/// same sessions with the same bookkeeping, and the manager is included in
/// state machine snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
}

impl SessionManager {
    /// Creates an empty session manager.
    pub fn new() -> Self {
        Self { sessions: HashMap::new() }
    }

    /// Registers a new session. The id is the register entry's log index,
    /// which is unique by construction.
    pub fn register(&mut self, id: SessionId, client: String, timeout: u64, timestamp: u64) {
        let session = Session::new(id, client, timeout, timestamp);
        let replaced = self.sessions.insert(id, session);
        assert!(replaced.is_none(), "session {id} registered twice");
    }

    /// Removes a session, returning it if it existed.
    pub fn unregister(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Returns a session by id.
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Returns a mutable session by id.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Applies a batch of keep-alive acknowledgements at the given timestamp.
    /// Unknown sessions are skipped: they may have expired concurrently.
    pub fn keep_alive(&mut self, acks: &[SessionAck], timestamp: u64) {
        for ack in acks {
            if let Some(session) = self.sessions.get_mut(&ack.session) {
                session.keep_alive(ack.command_sequence, ack.event_index, timestamp);
            }
        }
    }

    /// Refreshes all sessions' liveness to at least the given timestamp. Used
    /// when a new leader initializes, so sessions aren't expired against a
    /// clock they had no chance to keep up with.
    pub fn refresh_all(&mut self, timestamp: u64) {
        for session in self.sessions.values_mut() {
            if timestamp > session.last_keep_alive {
                session.last_keep_alive = timestamp;
            }
        }
    }

    /// Returns the sessions that have gone unheard-from for longer than the
    /// expiry factor times their timeout, as of the given clock. Expiry
    /// itself is decided by committing unregister entries for them.
    pub fn suspects(&self, now: u64) -> Vec<SessionId> {
        let mut expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| now.saturating_sub(s.last_keep_alive) > EXPIRY_FACTOR * s.timeout)
            .map(|s| s.id)
            .collect();
        expired.sort_unstable();
        expired
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> u64 {
        self.sessions.len() as u64
    }

    /// Returns true if there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Iterates over all sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}
