use crate::error::Error;
use crate::raft::Index;
use crate::session::SessionId;

/// Client-side session bookkeeping. Tracks the sequence numbers and indexes
/// the client has seen, which carry the exactly-once and ordering guarantees
/// across retries, reconnects, and leader changes.
#[derive(Debug)]
pub struct SessionState {
    /// The session id, or 0 before registration.
    pub session: SessionId,
    /// The client's unique identity.
    pub client: String,
    /// The session timeout in milliseconds, granted at registration.
    pub timeout: u64,
    /// The last command sequence number assigned to a submitted command.
    command_request: u64,
    /// The highest command sequence number whose response has completed.
    command_response: u64,
    /// The highest log index observed in responses. Queries wait for at
    /// least this much applied state, preserving read-your-writes.
    pub response_index: Index,
    /// The highest contiguous event index received from the server. Used for
    /// publish gap detection and acknowledged via keep-alives.
    pub event_index: Index,
    /// The connection attempt counter, distinguishing stale connections.
    connection: u64,
    /// Why the session is closed, if it is.
    closed: Option<Error>,
}

impl SessionState {
    /// Creates state for an unregistered session.
    pub fn new(client: String, timeout: u64) -> Self {
        Self {
            session: 0,
            client,
            timeout,
            command_request: 0,
            command_response: 0,
            response_index: 0,
            event_index: 0,
            connection: 0,
            closed: None,
        }
    }

    /// Assigns the next command sequence number.
    pub fn next_command_request(&mut self) -> u64 {
        self.command_request += 1;
        self.command_request
    }

    /// The last assigned command sequence number.
    pub fn command_request(&self) -> u64 {
        self.command_request
    }

    /// The highest completed command sequence number.
    pub fn command_response(&self) -> u64 {
        self.command_response
    }

    /// Records a completed command response.
    pub fn complete_command(&mut self, sequence: u64, index: Index) {
        if sequence > self.command_response {
            self.command_response = sequence;
        }
        if index > self.response_index {
            self.response_index = index;
        }
    }

    /// Records a completed query response.
    pub fn complete_query(&mut self, index: Index) {
        if index > self.response_index {
            self.response_index = index;
        }
    }

    /// Assigns the next connection attempt number.
    pub fn next_connection(&mut self) -> u64 {
        self.connection += 1;
        self.connection
    }

    /// Returns true once the session has a registered id and is not closed.
    pub fn is_open(&self) -> bool {
        self.session > 0 && self.closed.is_none()
    }

    /// Closes the session with the given reason.
    pub fn close(&mut self, reason: Error) {
        if self.closed.is_none() {
            self.closed = Some(reason);
        }
    }

    /// Returns the close reason, if closed.
    pub fn closed(&self) -> Option<&Error> {
        self.closed.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sequence_assignment() {
        let mut state = SessionState::new("c1".into(), 5000);
        assert_eq!(1, state.next_command_request());
        assert_eq!(2, state.next_command_request());
        assert_eq!(2, state.command_request());
        assert_eq!(0, state.command_response());
    }

    #[test]
    fn completion_is_monotonic() {
        let mut state = SessionState::new("c1".into(), 5000);
        state.complete_command(2, 10);
        state.complete_command(1, 8);
        assert_eq!(2, state.command_response());
        assert_eq!(10, state.response_index);

        state.complete_query(12);
        assert_eq!(12, state.response_index);
    }

    #[test]
    fn close_keeps_first_reason() {
        let mut state = SessionState::new("c1".into(), 5000);
        state.session = 3;
        assert!(state.is_open());
        state.close(Error::UnknownSession);
        state.close(Error::ClosedSession);
        assert_eq!(Some(&Error::UnknownSession), state.closed());
        assert!(!state.is_open());
    }
}
