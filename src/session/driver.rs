use super::{BufferedCommand, SessionId, SessionManager};
use crate::encoding;
use crate::error::{Error, Result};
use crate::protocol::{PublishRequest, QueryResponse};
use crate::raft::{Entry, EntryKind, Index};

use log::debug;
use serde_derive::{Deserialize, Serialize};

/// A replicated state machine. Commands mutate it, queries read it, and both
/// must be deterministic: given the same sequence of applies, every replica
/// must produce the same state, results, and events.
pub trait StateMachine: Send {
    /// Applies a command, returning its result. If the state machine returns
    /// Error::Internal, the node halts. Any other error is cached as the
    /// command's result and propagated to the client; the entry still
    /// consumes its sequence number.
    fn apply(&mut self, ctx: &mut ApplyContext, command: &[u8]) -> Result<Vec<u8>>;

    /// Queries the state machine. All errors are propagated to the caller.
    fn query(&self, query: &[u8]) -> Result<Vec<u8>>;

    /// Serializes the state machine for a snapshot.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the state machine contents from a snapshot.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// The deterministic context for a single command apply. Exposes the log
/// index and clock (so the state machine never reads the wall clock), and
/// collects events emitted during the apply for publication to sessions.
pub struct ApplyContext {
    index: Index,
    timestamp: u64,
    session: SessionId,
    events: Vec<(SessionId, Vec<u8>)>,
}

impl ApplyContext {
    fn new(index: Index, timestamp: u64, session: SessionId) -> Self {
        Self { index, timestamp, session, events: Vec::new() }
    }

    /// The log index of the command being applied.
    pub fn index(&self) -> Index {
        self.index
    }

    /// The deterministic clock, in milliseconds. Derived from entry
    /// timestamps, so it is identical on every replica.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The session that submitted the command.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Publishes an event to the submitting session.
    pub fn publish(&mut self, event: Vec<u8>) {
        self.events.push((self.session, event));
    }

    /// Publishes an event to another session.
    pub fn publish_to(&mut self, session: SessionId, event: Vec<u8>) {
        self.events.push((session, event));
    }
}

/// The outcome of applying a log entry, reported back to the node so it can
/// respond to clients, push events, and expire sessions.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// A command (or no-op fill) finished for a session.
    Command {
        session: SessionId,
        sequence: u64,
        index: Index,
        /// The session's highest published event index after the apply. The
        /// client delivers all events at or below it before this response.
        event_index: Index,
        /// The session's highest applied sequence number.
        last_sequence: u64,
        result: Result<Vec<u8>>,
    },
    /// A session was registered.
    Register { session: SessionId, timeout: u64 },
    /// A keep-alive batch was applied; carries sessions now considered
    /// expired, for the leader to propose unregisters.
    KeepAlive { index: Index, expired: Vec<SessionId> },
    /// A session was removed.
    Unregister { session: SessionId, expired: bool },
    /// An event batch is ready for delivery to a session.
    Publish(PublishRequest),
}

/// Serialized driver state for snapshots: the user state machine plus the
/// session bookkeeping, which must stay consistent with it.
#[derive(Serialize, Deserialize)]
struct Checkpoint {
    applied_index: Index,
    clock: u64,
    sessions: SessionManager,
    state: Vec<u8>,
}

impl encoding::Value for Checkpoint {}

/// The state machine driver. Owns the user state machine and the session
/// layer, and applies committed log entries to them strictly in log order.
/// Per session, command entries are additionally ordered by their sequence
/// number: an entry ahead of its predecessor is buffered until the
/// predecessor completes.
pub struct Driver {
    state: Box<dyn StateMachine>,
    sessions: SessionManager,
    /// The index of the last applied entry.
    applied_index: Index,
    /// The deterministic clock: the highest entry timestamp seen.
    clock: u64,
}

impl Driver {
    /// Creates a new driver around a user state machine.
    pub fn new(state: Box<dyn StateMachine>) -> Self {
        Self { state, sessions: SessionManager::new(), applied_index: 0, clock: 0 }
    }

    /// The index of the last applied entry.
    pub fn applied_index(&self) -> Index {
        self.applied_index
    }

    /// The deterministic clock in milliseconds.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// The live sessions.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Applies a log entry, returning what happened. Entries must be applied
    /// gap-free in log order. Only Error::Internal propagates as an error;
    /// state machine failures are captured in the command's result.
    pub fn apply(&mut self, entry: Entry) -> Result<Vec<Applied>> {
        assert_eq!(entry.index, self.applied_index + 1, "entry applied out of order");
        self.applied_index = entry.index;
        debug!("Applying {entry:?}");

        let mut out = Vec::new();
        match entry.kind {
            EntryKind::Command { session, sequence, timestamp, command } => {
                self.advance_clock(timestamp);
                self.apply_command(entry.index, session, sequence, Some(command), &mut out)?;
            }
            EntryKind::NoOp { session, sequence, timestamp } => {
                self.advance_clock(timestamp);
                self.apply_command(entry.index, session, sequence, None, &mut out)?;
            }
            EntryKind::Register { client, timeout, timestamp } => {
                self.advance_clock(timestamp);
                self.sessions.register(entry.index, client, timeout, timestamp);
                out.push(Applied::Register { session: entry.index, timeout });
            }
            EntryKind::KeepAlive { acks, timestamp } => {
                self.advance_clock(timestamp);
                self.sessions.keep_alive(&acks, timestamp);
                let expired = self.sessions.suspects(self.clock);
                out.push(Applied::KeepAlive { index: entry.index, expired });
            }
            EntryKind::Unregister { session, expired, timestamp } => {
                self.advance_clock(timestamp);
                // Reported even if the session raced an expiry and is already
                // gone, so a pending unregister request still gets answered.
                self.sessions.unregister(session);
                out.push(Applied::Unregister { session, expired });
            }
            EntryKind::Connect { session, node } => {
                if let Some(session) = self.sessions.get_mut(session) {
                    session.connected_node = Some(node);
                }
            }
            EntryKind::Initialize { timestamp } => {
                self.advance_clock(timestamp);
                self.sessions.refresh_all(timestamp);
            }
            // Configuration changes are handled by the node itself.
            EntryKind::Configuration { .. } => {}
        }
        Ok(out)
    }

    /// Applies a command entry for a session, respecting sequence order: a
    /// retry of an applied sequence returns the cached result, a command
    /// ahead of its predecessor is buffered, and applying a command drains
    /// any buffered successors.
    fn apply_command(
        &mut self,
        index: Index,
        session_id: SessionId,
        sequence: u64,
        command: Option<Vec<u8>>,
        out: &mut Vec<Applied>,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            out.push(Applied::Command {
                session: session_id,
                sequence,
                index,
                event_index: 0,
                last_sequence: 0,
                result: Err(Error::UnknownSession),
            });
            return Ok(());
        };

        if sequence <= session.command_sequence {
            // A retry of an already-applied command: return the cached result
            // without touching the state machine. A result pruned from the
            // cache means the client already acknowledged a later response,
            // so nothing legitimate retries it.
            let result = session.cached_result(sequence).cloned().unwrap_or(Err(Error::Abort));
            out.push(Applied::Command {
                session: session_id,
                sequence,
                index,
                event_index: session.event_index,
                last_sequence: session.command_sequence,
                result,
            });
            return Ok(());
        }

        if sequence > session.command_sequence + 1 {
            debug!("Buffering command {sequence} for session {session_id}");
            session.buffer_command(
                sequence,
                BufferedCommand { index, timestamp: self.clock, command },
            );
            return Ok(());
        }

        // The command is next in sequence order. Execute it, then drain any
        // buffered successors it unblocks.
        let mut next = BufferedCommand { index, timestamp: self.clock, command };
        loop {
            self.execute(session_id, next, out)?;
            let Some(session) = self.sessions.get_mut(session_id) else { break };
            match session.take_buffered(session.command_sequence + 1) {
                Some(buffered) => next = buffered,
                None => break,
            }
        }
        Ok(())
    }

    /// Executes a single in-order command against the state machine, queues
    /// any events it emitted, and updates the session bookkeeping.
    fn execute(
        &mut self,
        session_id: SessionId,
        command: BufferedCommand,
        out: &mut Vec<Applied>,
    ) -> Result<()> {
        let BufferedCommand { index, timestamp, command } = command;
        let sequence = self
            .sessions
            .get(session_id)
            .expect("executing command for missing session")
            .command_sequence
            + 1;

        let mut events = Vec::new();
        let result = match &command {
            Some(command) => {
                let mut ctx = ApplyContext::new(index, timestamp.max(self.clock), session_id);
                match self.state.apply(&mut ctx, command) {
                    Err(err) if err.is_internal() => return Err(err),
                    result => {
                        events = ctx.events;
                        result
                    }
                }
            }
            // A no-op fill consumes the sequence number without a result.
            None => Ok(Vec::new()),
        };

        // Queue emitted events on their target sessions, grouped per session
        // in emit order, and surface the batches for delivery. Events publish
        // at the currently applying log index: a buffered command drained by
        // a later entry publishes at that entry's index, keeping each
        // session's event index monotonic.
        let publish_index = self.applied_index;
        for (target, batch) in group_events(events) {
            if let Some(session) = self.sessions.get_mut(target) {
                let batch = session.publish(publish_index, batch);
                out.push(Applied::Publish(PublishRequest {
                    session: target,
                    event_index: batch.event_index,
                    previous_index: batch.previous_index,
                    events: batch.events,
                }));
            }
        }

        let session = self.sessions.get_mut(session_id).expect("session vanished during apply");
        session.command_sequence = sequence;
        session.last_applied = index;
        session.cache_result(sequence, result.clone());
        out.push(Applied::Command {
            session: session_id,
            sequence,
            index,
            event_index: session.event_index,
            last_sequence: session.command_sequence,
            result,
        });
        Ok(())
    }

    /// Executes a query against the state machine for a session. Queries are
    /// not logged; the caller is responsible for commit/leadership gating.
    pub fn query(&self, session_id: SessionId, sequence: u64, query: &[u8]) -> Result<QueryResponse> {
        let Some(session) = self.sessions.get(session_id) else {
            return Err(Error::UnknownSession);
        };
        if sequence > session.command_sequence {
            // The query is ordered after commands the session hasn't finished
            // submitting; force the client to complete them first.
            return Err(Error::QueryGap);
        }
        let result = self.state.query(query)?;
        Ok(QueryResponse {
            index: self.applied_index,
            event_index: session.event_index,
            result,
        })
    }

    /// Returns the queued event batches above the given index for a session,
    /// for resend after the client detects a delivery gap.
    pub fn reset_events(&self, session_id: SessionId, index: Index) -> Result<Vec<PublishRequest>> {
        let Some(session) = self.sessions.get(session_id) else {
            return Err(Error::UnknownSession);
        };
        Ok(session
            .events_after(index)
            .into_iter()
            .map(|batch| PublishRequest {
                session: session_id,
                event_index: batch.event_index,
                previous_index: batch.previous_index,
                events: batch.events,
            })
            .collect())
    }

    /// Returns sessions that are overdue for expiry as of the given clock.
    pub fn suspects(&self, now: u64) -> Vec<SessionId> {
        self.sessions.suspects(now)
    }

    /// Serializes the driver (state machine and sessions) for a snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        use encoding::Value as _;
        Checkpoint {
            applied_index: self.applied_index,
            clock: self.clock,
            sessions: self.sessions.clone(),
            state: self.state.snapshot()?,
        }
        .encode()
    }

    /// Restores the driver from a snapshot, replacing all current state.
    pub fn restore(&mut self, data: &[u8]) -> Result<()> {
        use encoding::Value as _;
        let checkpoint = Checkpoint::decode(data)?;
        self.state.restore(&checkpoint.state)?;
        self.sessions = checkpoint.sessions;
        self.applied_index = checkpoint.applied_index;
        self.clock = checkpoint.clock;
        Ok(())
    }

    fn advance_clock(&mut self, timestamp: u64) {
        if timestamp > self.clock {
            self.clock = timestamp;
        }
    }
}

/// Groups emitted (session, event) pairs into per-session batches, keeping
/// emit order within each session and first-emit order across sessions.
fn group_events(events: Vec<(SessionId, Vec<u8>)>) -> Vec<(SessionId, Vec<Vec<u8>>)> {
    let mut grouped: Vec<(SessionId, Vec<Vec<u8>>)> = Vec::new();
    for (session, event) in events {
        match grouped.iter_mut().find(|(id, _)| *id == session) {
            Some((_, batch)) => batch.push(event),
            None => grouped.push((session, vec![event])),
        }
    }
    grouped
}
