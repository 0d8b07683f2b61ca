use super::{SessionId, RESULT_CACHE_WINDOW};
use crate::error::Result;
use crate::raft::{Index, NodeID};

use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A queued batch of events produced for a session during a single command
/// apply. Batches are retained until the client acknowledges them, so they
/// can be resent after a gap or reconnect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// The log index of the command whose apply produced the events.
    pub event_index: Index,
    /// The session's previous event index, for client gap detection.
    pub previous_index: Index,
    /// The event payloads.
    pub events: Vec<Vec<u8>>,
}

/// A server-side session record. Sessions are replicated state: they are
/// created, kept alive, and removed via log entries, so every replica agrees
/// on their existence and bookkeeping. The session gives a client
/// exactly-once command semantics (via the sequence number and result cache)
/// and in-order event delivery (via the event queue).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The session ID, i.e. the index of its register entry.
    pub id: SessionId,
    /// The client identity that registered the session.
    pub client: String,
    /// The session timeout in milliseconds.
    pub timeout: u64,
    /// The applied clock timestamp at which the session was last kept alive.
    pub last_keep_alive: u64,
    /// The highest sequence number whose command has been applied.
    pub command_sequence: u64,
    /// The highest log index applied for this session.
    pub last_applied: Index,
    /// The highest event index published to this session.
    pub event_index: Index,
    /// The highest event index the client has acknowledged.
    pub complete_index: Index,
    /// The server the client's connection is bound to, if any.
    pub connected_node: Option<NodeID>,
    /// Cached command results by sequence number, for retry idempotence.
    /// Pruned by keep-alive acknowledgements and bounded by a hard window.
    responses: BTreeMap<u64, Result<Vec<u8>>>,
    /// Commands buffered ahead of the session's sequence order, keyed by
    /// sequence. A buffered command applies once its predecessor completes.
    buffered: BTreeMap<u64, BufferedCommand>,
    /// Event batches pending client acknowledgement.
    events: VecDeque<EventBatch>,
}

/// A command buffered for later apply, retaining its log position and stamp.
/// A None command is a no-op fill that consumes the sequence number without
/// invoking the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferedCommand {
    pub index: Index,
    pub timestamp: u64,
    pub command: Option<Vec<u8>>,
}

impl Session {
    /// Creates a new session.
    pub fn new(id: SessionId, client: String, timeout: u64, timestamp: u64) -> Self {
        Self {
            id,
            client,
            timeout,
            last_keep_alive: timestamp,
            command_sequence: 0,
            last_applied: 0,
            event_index: 0,
            complete_index: 0,
            connected_node: None,
            responses: BTreeMap::new(),
            buffered: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Caches a command result under its sequence number, evicting the oldest
    /// cached result if the hard window is exceeded.
    pub fn cache_result(&mut self, sequence: u64, result: Result<Vec<u8>>) {
        self.responses.insert(sequence, result);
        while self.responses.len() as u64 > RESULT_CACHE_WINDOW {
            self.responses.pop_first();
        }
    }

    /// Returns the cached result for a sequence number, if still retained.
    pub fn cached_result(&self, sequence: u64) -> Option<&Result<Vec<u8>>> {
        self.responses.get(&sequence)
    }

    /// Buffers a command that arrived ahead of sequence order.
    pub fn buffer_command(&mut self, sequence: u64, command: BufferedCommand) {
        self.buffered.insert(sequence, command);
    }

    /// Takes the buffered command with the given sequence, if any.
    pub fn take_buffered(&mut self, sequence: u64) -> Option<BufferedCommand> {
        self.buffered.remove(&sequence)
    }

    /// Queues an event batch published at the given log index, advancing the
    /// session's event index. Returns the batch for delivery.
    pub fn publish(&mut self, index: Index, events: Vec<Vec<u8>>) -> EventBatch {
        assert!(index >= self.event_index, "event index regression");
        let batch =
            EventBatch { event_index: index, previous_index: self.event_index, events };
        self.event_index = index;
        self.events.push_back(batch.clone());
        batch
    }

    /// Acknowledges events up to and including the given index, pruning the
    /// queue and advancing the complete index.
    pub fn ack_events(&mut self, index: Index) {
        if index > self.complete_index {
            self.complete_index = index;
        }
        while self.events.front().map(|b| b.event_index <= index).unwrap_or(false) {
            self.events.pop_front();
        }
    }

    /// Returns the queued event batches above the given index, for resend
    /// after the client detects a gap.
    pub fn events_after(&self, index: Index) -> Vec<EventBatch> {
        self.events.iter().filter(|b| b.event_index > index).cloned().collect()
    }

    /// Records a keep-alive: prunes acknowledged results and events, and
    /// refreshes the session's liveness stamp.
    pub fn keep_alive(&mut self, command_sequence: u64, event_index: Index, timestamp: u64) {
        self.responses.retain(|&sequence, _| sequence > command_sequence);
        self.ack_events(event_index);
        if timestamp > self.last_keep_alive {
            self.last_keep_alive = timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    fn session() -> Session {
        Session::new(1, "c1".into(), 5000, 1000)
    }

    #[test]
    fn result_cache_prunes_on_keep_alive() {
        let mut s = session();
        s.cache_result(1, Ok(vec![0x01]));
        s.cache_result(2, Ok(vec![0x02]));
        s.cache_result(3, Err(Error::Application("b00m".into())));

        s.keep_alive(2, 0, 2000);
        assert_eq!(None, s.cached_result(1));
        assert_eq!(None, s.cached_result(2));
        assert_eq!(Some(&Err(Error::Application("b00m".into()))), s.cached_result(3));
        assert_eq!(2000, s.last_keep_alive);
    }

    #[test]
    fn result_cache_bounded() {
        let mut s = session();
        for sequence in 1..=(RESULT_CACHE_WINDOW + 10) {
            s.cache_result(sequence, Ok(vec![]));
        }
        assert_eq!(None, s.cached_result(1));
        assert_eq!(None, s.cached_result(10));
        assert_eq!(Some(&Ok(vec![])), s.cached_result(11));
    }

    #[test]
    fn event_queue() {
        let mut s = session();
        let batch = s.publish(7, vec![vec![0xaa]]);
        assert_eq!(batch, EventBatch { event_index: 7, previous_index: 0, events: vec![vec![0xaa]] });
        let batch = s.publish(9, vec![vec![0xbb]]);
        assert_eq!(batch.previous_index, 7);
        assert_eq!(s.event_index, 9);

        // Both batches are retained for resend until acknowledged.
        assert_eq!(2, s.events_after(0).len());
        assert_eq!(vec![batch.clone()], s.events_after(7));

        s.ack_events(7);
        assert_eq!(7, s.complete_index);
        assert_eq!(vec![batch], s.events_after(0));

        s.ack_events(9);
        assert!(s.events_after(0).is_empty());
    }

    #[test]
    fn buffered_commands() {
        let mut s = session();
        s.buffer_command(3, BufferedCommand { index: 10, timestamp: 0, command: Some(vec![0x03]) });
        assert_eq!(None, s.take_buffered(2));
        assert!(s.take_buffered(3).is_some());
        assert_eq!(None, s.take_buffered(3));
    }
}
