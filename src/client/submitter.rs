use super::connection::is_operation_error;
use super::sequencer::{ResponseInfo, Sequencer};
use super::session::SessionState;
use crate::error::{Error, Result};
use crate::protocol::{
    CommandRequest, CommandResponse, Consistency, QueryRequest, Request, Response,
};
use crate::raft::Index;

use log::debug;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The retry backoff schedule in seconds, capped at the last entry.
const FIBONACCI: [u64; 5] = [1, 1, 2, 3, 5];

/// The number of attempts before an operation is abandoned. An abandoned
/// command is replaced by a no-op fill so the session's sequence space stays
/// dense; without it, every later command would stall on the missing
/// sequence number.
const MAX_ATTEMPTS: u32 = 10;

/// Delivers an operation result to the submitting caller.
pub type ResultSender = crossbeam::channel::Sender<Result<Vec<u8>>>;

/// A submitted operation.
#[derive(Debug)]
enum Operation {
    /// A session command. A None command is a no-op fill for an abandoned
    /// sequence number.
    Command { sequence: u64, command: Option<Vec<u8>> },
    /// A session query, with its ordering context captured at submit time.
    Query { sequence: u64, index: Index, query: Vec<u8>, consistency: Consistency },
}

/// A single operation attempt, retried until it completes or is abandoned.
#[derive(Debug)]
struct Attempt {
    attempt: u32,
    operation: Operation,
    /// The caller awaiting the result; None for no-op fills.
    result_tx: Option<ResultSender>,
    /// When to (re)transmit; None while a transmission is in flight.
    retry_at: Option<Instant>,
}

/// Asks the driver to send an immediate keep-alive resetting the leader's
/// sequencing, then resubmit commands after the given sequence number.
#[derive(Debug, PartialEq)]
pub struct ResetIndexes {
    pub from_sequence: u64,
    pub attempt: u32,
}

/// Submits session operations and shepherds them to completion: assigns
/// command sequence numbers, retries transient failures with Fibonacci
/// backoff, resubmits out-of-order commands when the leader reports a gap,
/// and hands completed responses to the sequencer so callers observe them in
/// order with server events.
pub struct Submitter {
    state: Rc<RefCell<SessionState>>,
    sequencer: Sequencer,
    /// Pending attempts by their sequencer request number.
    attempts: BTreeMap<u64, Attempt>,
    /// The command response sequence at the last reset keep-alive, limiting
    /// resets to one per observed sequence.
    keep_alive_marker: u64,
}

impl Submitter {
    /// Creates a submitter over the given session state.
    pub fn new(state: Rc<RefCell<SessionState>>) -> Self {
        Self { state, sequencer: Sequencer::new(), attempts: BTreeMap::new(), keep_alive_marker: 0 }
    }

    /// The sequencer, for event delivery.
    pub fn sequencer(&mut self) -> &mut Sequencer {
        &mut self.sequencer
    }

    /// Returns the number of pending operations.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Returns true if no operations are pending.
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Submits a command, due for transmission immediately.
    pub fn submit_command(&mut self, command: Vec<u8>, result_tx: ResultSender, now: Instant) {
        if let Some(reason) = self.state.borrow().closed() {
            let _ = result_tx.send(Err(reason.clone()));
            return;
        }
        let sequence = self.state.borrow_mut().next_command_request();
        let request = self.sequencer.next_request();
        self.attempts.insert(
            request,
            Attempt {
                attempt: 1,
                operation: Operation::Command { sequence, command: Some(command) },
                result_tx: Some(result_tx),
                retry_at: Some(now),
            },
        );
    }

    /// Submits a query, due for transmission immediately.
    pub fn submit_query(
        &mut self,
        query: Vec<u8>,
        consistency: Consistency,
        result_tx: ResultSender,
        now: Instant,
    ) {
        if let Some(reason) = self.state.borrow().closed() {
            let _ = result_tx.send(Err(reason.clone()));
            return;
        }
        let (sequence, index) = {
            let state = self.state.borrow();
            (state.command_request(), state.response_index)
        };
        let request = self.sequencer.next_request();
        self.attempts.insert(
            request,
            Attempt {
                attempt: 1,
                operation: Operation::Query { sequence, index, query, consistency },
                result_tx: Some(result_tx),
                retry_at: Some(now),
            },
        );
    }

    /// Returns the requests due for (re)transmission, marking them in
    /// flight.
    pub fn due(&mut self, now: Instant) -> Vec<(u64, Request)> {
        let session = self.state.borrow().session;
        let mut due = Vec::new();
        for (request, attempt) in self.attempts.iter_mut() {
            if attempt.retry_at.map(|at| at <= now).unwrap_or(false) {
                attempt.retry_at = None;
                due.push((*request, build_request(session, &attempt.operation)));
            }
        }
        due
    }

    /// Returns the next retransmission deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.attempts.values().filter_map(|a| a.retry_at).min()
    }

    /// Handles the response for an attempt. May return a reset-indexes
    /// action for the driver to perform.
    pub fn handle_response(
        &mut self,
        request: u64,
        response: Result<Response>,
        now: Instant,
    ) -> Option<ResetIndexes> {
        let Some(attempt) = self.attempts.get(&request) else {
            return None;
        };
        let is_command = matches!(attempt.operation, Operation::Command { .. });
        let attempt_number = attempt.attempt;

        match response {
            Ok(Response::Command(response)) if is_command => {
                let attempt = self.attempts.remove(&request).expect("fetched above");
                self.complete_command(request, attempt, response);
                None
            }
            // The leader saw this command ahead of its session's sequence
            // order: resubmit everything after the acknowledged sequence.
            Err(Error::CommandGap { last_sequence }) if is_command => {
                let response_sequence = self.state.borrow().command_response();
                if last_sequence < response_sequence
                    && self.keep_alive_marker != response_sequence
                {
                    // The cluster has a new leader whose sequencing is behind
                    // what we've already observed: reset its indexes with a
                    // keep-alive before resubmitting.
                    self.keep_alive_marker = response_sequence;
                    Some(ResetIndexes {
                        from_sequence: response_sequence,
                        attempt: attempt_number,
                    })
                } else {
                    self.resubmit_after(last_sequence, attempt_number, now);
                    None
                }
            }
            Err(err) if is_operation_error(&err) => {
                // Surfaced to the caller; a dead session is also closed
                // locally so later submissions fail fast.
                let attempt = self.attempts.remove(&request).expect("fetched above");
                if is_command && err == Error::UnknownSession {
                    self.state.borrow_mut().close(Error::UnknownSession);
                }
                self.complete_error(request, attempt, err);
                None
            }
            Ok(Response::Query(response)) if !is_command => {
                let attempt = self.attempts.remove(&request).expect("fetched above");
                let state = self.state.clone();
                let index = response.index;
                let result_tx = attempt.result_tx;
                self.sequencer.sequence_response(
                    request,
                    Some(ResponseInfo { event_index: response.event_index }),
                    Box::new(move || {
                        state.borrow_mut().complete_query(index);
                        if let Some(tx) = result_tx {
                            let _ = tx.send(Ok(response.result));
                        }
                    }),
                );
                None
            }
            // Queries surface all cluster errors; commands retry the rest
            // (leader changes, aborts) with backoff.
            Err(err) if !is_command => {
                let attempt = self.attempts.remove(&request).expect("fetched above");
                self.complete_error(request, attempt, err);
                None
            }
            Err(err) => {
                self.retry(request, err, now);
                None
            }
            Ok(response) => {
                let attempt = self.attempts.remove(&request).expect("fetched above");
                self.complete_error(
                    request,
                    attempt,
                    Error::Internal(format!("unexpected response {response:?}")),
                );
                None
            }
        }
    }

    /// Reschedules all in-flight attempts after a connection loss, with
    /// per-attempt backoff.
    pub fn handle_disconnect(&mut self, now: Instant) {
        let in_flight: Vec<u64> = self
            .attempts
            .iter()
            .filter(|(_, a)| a.retry_at.is_none())
            .map(|(request, _)| *request)
            .collect();
        for request in in_flight {
            self.retry(request, Error::IO("connection lost".into()), now);
        }
    }

    /// Resubmits pending commands with session sequence numbers after the
    /// given one, where the attempt count does not exceed the failing
    /// attempt's. Queries are not resubmitted, since they cannot be replayed
    /// without losing linearizable semantics.
    pub fn resubmit_after(&mut self, from_sequence: u64, attempt_limit: u32, now: Instant) {
        for (request, attempt) in self.attempts.iter_mut() {
            if let Operation::Command { sequence, .. } = attempt.operation {
                if sequence > from_sequence && attempt.attempt <= attempt_limit {
                    debug!("Resubmitting command {sequence} (request {request})");
                    attempt.attempt += 1;
                    attempt.retry_at = Some(now);
                }
            }
        }
    }

    /// Fails all pending operations, e.g. on close.
    pub fn abort_all(&mut self, reason: Error) {
        let attempts = std::mem::take(&mut self.attempts);
        for (request, attempt) in attempts {
            self.complete_error(request, attempt, reason.clone());
        }
    }

    /// Schedules a retry with Fibonacci backoff, or abandons the attempt
    /// once the limit is reached: the caller gets the error, and an
    /// abandoned command is replaced with a no-op fill for its sequence
    /// number.
    fn retry(&mut self, request: u64, err: Error, now: Instant) {
        let Some(attempt) = self.attempts.get_mut(&request) else {
            return;
        };
        if attempt.attempt < MAX_ATTEMPTS {
            let backoff = FIBONACCI[(attempt.attempt as usize - 1).min(FIBONACCI.len() - 1)];
            attempt.attempt += 1;
            attempt.retry_at = Some(now + Duration::from_secs(backoff));
            return;
        }

        let attempt = self.attempts.remove(&request).expect("fetched above");
        debug!("Abandoning request {request} after {} attempts: {err}", attempt.attempt);
        let fill = match &attempt.operation {
            Operation::Command { sequence, command: Some(_) } => Some(*sequence),
            _ => None,
        };
        self.complete_error(request, attempt, err);
        if let Some(sequence) = fill {
            let fill_request = self.sequencer.next_request();
            self.attempts.insert(
                fill_request,
                Attempt {
                    attempt: 1,
                    operation: Operation::Command { sequence, command: None },
                    result_tx: None,
                    retry_at: Some(now),
                },
            );
        }
    }

    /// Completes a command response through the sequencer, so its callback
    /// fires after the events its event index covers.
    fn complete_command(&mut self, request: u64, attempt: Attempt, response: CommandResponse) {
        let Operation::Command { sequence, .. } = attempt.operation else {
            unreachable!("command response for non-command attempt");
        };
        let state = self.state.clone();
        let result_tx = attempt.result_tx;
        let CommandResponse { index, event_index, result, .. } = response;
        self.sequencer.sequence_response(
            request,
            Some(ResponseInfo { event_index }),
            Box::new(move || {
                state.borrow_mut().complete_command(sequence, index);
                if let Some(tx) = result_tx {
                    let _ = tx.send(result);
                }
            }),
        );
    }

    /// Completes a failed operation through the sequencer, in request order.
    fn complete_error(&mut self, request: u64, attempt: Attempt, err: Error) {
        let result_tx = attempt.result_tx;
        self.sequencer.sequence_response(
            request,
            None,
            Box::new(move || {
                if let Some(tx) = result_tx {
                    let _ = tx.send(Err(err));
                }
            }),
        );
    }
}

/// Builds the wire request for an operation.
fn build_request(session: crate::session::SessionId, operation: &Operation) -> Request {
    match operation {
        Operation::Command { sequence, command } => Request::Command(CommandRequest {
            session,
            sequence: *sequence,
            command: command.clone(),
        }),
        Operation::Query { sequence, index, query, consistency } => {
            Request::Query(QueryRequest {
                session,
                sequence: *sequence,
                index: *index,
                query: query.clone(),
                consistency: *consistency,
            })
        }
    }
}
