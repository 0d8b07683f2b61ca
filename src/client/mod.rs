//! The cluster client: registers a session, submits commands and queries
//! with exactly-once semantics, and delivers server-pushed events in order
//! with responses.
//!
//! All protocol work happens on a driver thread owning the connection,
//! sequencer, and submitter. Callers talk to it over channels, so the
//! user-facing handle is cheap to share across threads while the session
//! state itself stays single-threaded.

mod connection;
mod selector;
mod sequencer;
mod session;
mod submitter;

pub use crate::protocol::Consistency;
pub use sequencer::Sequencer;

use connection::{is_operation_error, Connection};
use sequencer::EventInfo;
use session::SessionState;
use submitter::{ResetIndexes, Submitter};

use crate::error::{Error, Result};
use crate::protocol::{
    KeepAliveRequest, RegisterRequest, Request, ResetRequest, Response, ServerFrame,
    UnregisterRequest,
};
use crate::session::SessionId;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The handshake and registration call timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// The maximum idle wait per driver loop iteration. Bounds the latency of
/// picking up newly submitted operations.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The number of registration attempts before giving up.
const REGISTER_ATTEMPTS: u32 = 10;

/// A callback invoked with each server-pushed session event, in order.
pub type EventHandler = Box<dyn FnMut(Vec<u8>) + Send>;

/// Client options.
pub struct Options {
    /// The client's unique identity. Defaults to a random UUID.
    pub client_id: String,
    /// The requested session timeout in milliseconds.
    pub timeout: u64,
    /// The handler for server-pushed session events, if any.
    pub on_event: Option<EventHandler>,
}

impl Default for Options {
    fn default() -> Self {
        Self { client_id: uuid::Uuid::new_v4().to_string(), timeout: 5000, on_event: None }
    }
}

/// Operations sent to the driver thread.
enum DriverOp {
    Command { command: Vec<u8>, result_tx: submitter::ResultSender },
    Query { query: Vec<u8>, consistency: Consistency, result_tx: submitter::ResultSender },
    Close { done_tx: Sender<()> },
}

/// A session client handle. Cloneable and shareable across threads; all
/// operations funnel to the session's driver thread.
#[derive(Clone)]
pub struct Client {
    session: SessionId,
    ops_tx: Sender<DriverOp>,
}

impl Client {
    /// Connects to the cluster at the given member addresses and registers a
    /// session. Blocks until the session is established or registration
    /// fails.
    pub fn connect(servers: Vec<String>, options: Options) -> Result<Client> {
        let (ops_tx, ops_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        std::thread::spawn(move || Driver::run(servers, options, ops_rx, ready_tx));
        let session = ready_rx.recv()??;
        Ok(Client { session, ops_tx })
    }

    /// Returns the session id.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Submits a command without waiting for its result. The returned
    /// channel yields the result once the command completes; results across
    /// submissions complete in submission order.
    pub fn submit(&self, command: Vec<u8>) -> Result<Receiver<Result<Vec<u8>>>> {
        let (result_tx, result_rx) = bounded(1);
        self.ops_tx
            .send(DriverOp::Command { command, result_tx })
            .map_err(|_| Error::ClosedSession)?;
        Ok(result_rx)
    }

    /// Submits a command and blocks for its result.
    pub fn execute(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.submit(command)?.recv().map_err(|_| Error::ClosedSession)?
    }

    /// Submits a query at the given consistency level and blocks for its
    /// result.
    pub fn query(&self, query: Vec<u8>, consistency: Consistency) -> Result<Vec<u8>> {
        let (result_tx, result_rx) = bounded(1);
        self.ops_tx
            .send(DriverOp::Query { query, consistency, result_tx })
            .map_err(|_| Error::ClosedSession)?;
        result_rx.recv().map_err(|_| Error::ClosedSession)?
    }

    /// Closes the session, unregistering it from the cluster.
    pub fn close(&self) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.ops_tx.send(DriverOp::Close { done_tx }).map_err(|_| Error::ClosedSession)?;
        done_rx.recv().map_err(|_| Error::ClosedSession)
    }
}

/// The session driver, owning all client protocol state.
struct Driver {
    connection: Connection,
    state: Rc<RefCell<SessionState>>,
    submitter: Submitter,
    on_event: Option<Rc<RefCell<EventHandler>>>,
    /// Maps in-flight connection frame ids to submitter request numbers.
    in_flight: HashMap<u64, u64>,
    /// The frame id of an in-flight keep-alive, if any.
    keepalive_frame: Option<u64>,
    /// A resubmission to perform once the in-flight keep-alive completes.
    pending_reset: Option<ResetIndexes>,
    /// When the next periodic keep-alive is due.
    next_keepalive: Instant,
}

impl Driver {
    /// Runs the driver: registers the session (reporting the outcome on
    /// ready_tx), then serves operations until closed.
    fn run(
        servers: Vec<String>,
        options: Options,
        ops_rx: Receiver<DriverOp>,
        ready_tx: Sender<Result<SessionId>>,
    ) {
        let state =
            Rc::new(RefCell::new(SessionState::new(options.client_id, options.timeout)));
        let mut driver = Driver {
            connection: Connection::new(servers, CALL_TIMEOUT),
            state: state.clone(),
            submitter: Submitter::new(state),
            on_event: options.on_event.map(|handler| Rc::new(RefCell::new(handler))),
            in_flight: HashMap::new(),
            keepalive_frame: None,
            pending_reset: None,
            next_keepalive: Instant::now(),
        };

        match driver.register() {
            Ok(session) => {
                if ready_tx.send(Ok(session)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        }

        if let Err(err) = driver.serve(ops_rx) {
            warn!("Client session driver failed: {err}");
        }
    }

    /// Registers a session with the cluster, retrying with backoff across
    /// members until a leader accepts.
    fn register(&mut self) -> Result<SessionId> {
        let request = {
            let state = self.state.borrow();
            Request::Register(RegisterRequest {
                client: state.client.clone(),
                timeout: state.timeout,
            })
        };
        for attempt in 0..REGISTER_ATTEMPTS {
            let result = {
                let mut state = self.state.borrow_mut();
                self.connection
                    .connect(&mut state)
                    .and_then(|conn| conn.call(request.clone(), CALL_TIMEOUT))
            };
            match result {
                Ok(Response::Register(register)) => {
                    {
                        let mut state = self.state.borrow_mut();
                        state.session = register.session;
                        state.timeout = register.timeout;
                    }
                    let members =
                        register.members.iter().map(|m| m.client_address.clone()).collect();
                    self.connection.update_members(register.leader, members);
                    // Bind the new session to the connection for event
                    // delivery.
                    let mut state = self.state.borrow_mut();
                    self.connection.rebind(&mut state)?;
                    self.next_keepalive =
                        Instant::now() + Duration::from_millis(state.timeout / 2);
                    debug!("Registered session {}", register.session);
                    return Ok(register.session);
                }
                Ok(response) => {
                    debug!("Unexpected register response {response:?}");
                    self.connection.disconnect();
                }
                Err(err) if is_operation_error(&err) => return Err(err),
                Err(err) => {
                    debug!("Registration attempt failed: {err}");
                    self.connection.disconnect();
                }
            }
            std::thread::sleep(Duration::from_millis(100 << attempt.min(5)));
        }
        Err(Error::IO("failed to register a session with the cluster".into()))
    }

    /// The driver loop: pumps operations, retransmissions, keep-alives, and
    /// inbound frames.
    fn serve(&mut self, ops_rx: Receiver<DriverOp>) -> Result<()> {
        loop {
            // Pick up submitted operations.
            let now = Instant::now();
            while let Ok(op) = ops_rx.try_recv() {
                match op {
                    DriverOp::Command { command, result_tx } => {
                        self.submitter.submit_command(command, result_tx, now)
                    }
                    DriverOp::Query { query, consistency, result_tx } => {
                        self.submitter.submit_query(query, consistency, result_tx, now)
                    }
                    DriverOp::Close { done_tx } => {
                        self.close();
                        let _ = done_tx.send(());
                        return Ok(());
                    }
                }
            }

            // Transmit due operations.
            for (request_id, request) in self.submitter.due(now) {
                match self.send(request) {
                    Ok(frame) => {
                        self.in_flight.insert(frame, request_id);
                    }
                    Err(err) => {
                        debug!("Send failed: {err}");
                        self.handle_disconnect(now);
                        break;
                    }
                }
            }

            // Periodic keep-alive.
            if now >= self.next_keepalive && self.state.borrow().is_open() {
                self.send_keepalive(now);
            }

            // Wait for inbound frames.
            let wait = self.wait_duration(now);
            match self.connection.recv_timeout(wait) {
                Ok(Some(frame)) => self.handle_frame(frame, Instant::now())?,
                Ok(None) => {}
                Err(err) => {
                    debug!("Connection lost: {err}");
                    self.handle_disconnect(Instant::now());
                }
            }
        }
    }

    /// Computes how long to wait for inbound frames this iteration.
    fn wait_duration(&self, now: Instant) -> Duration {
        let mut deadline = self.next_keepalive;
        if let Some(retry) = self.submitter.next_deadline() {
            deadline = deadline.min(retry);
        }
        deadline
            .saturating_duration_since(now)
            .clamp(Duration::from_millis(1), POLL_INTERVAL)
    }

    /// Sends a request, returning its frame id.
    fn send(&mut self, request: Request) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        self.connection.send(&mut state, request)
    }

    /// Sends a keep-alive acknowledging received responses and events.
    fn send_keepalive(&mut self, now: Instant) {
        let request = {
            let state = self.state.borrow();
            Request::KeepAlive(KeepAliveRequest {
                session: state.session,
                command_sequence: state.command_response(),
                event_index: state.event_index,
            })
        };
        match self.send(request) {
            Ok(frame) => {
                self.keepalive_frame = Some(frame);
                let timeout = self.state.borrow().timeout;
                self.next_keepalive = now + Duration::from_millis(timeout / 2);
            }
            Err(err) => {
                debug!("Keep-alive send failed: {err}");
                self.next_keepalive = now + Duration::from_secs(1);
            }
        }
    }

    /// Handles an inbound frame.
    fn handle_frame(&mut self, frame: ServerFrame, now: Instant) -> Result<()> {
        match frame {
            ServerFrame::Response { id, response } => {
                if self.keepalive_frame == Some(id) {
                    self.keepalive_frame = None;
                    self.handle_keepalive_response(response, now);
                } else if let Some(request_id) = self.in_flight.remove(&id) {
                    // Cluster errors that aren't operation outcomes mean this
                    // server can't serve us; reconnect to the next member,
                    // rescheduling everything else in flight with it.
                    let reconnect = matches!(&response, Err(err) if !is_operation_error(err));
                    if let Some(reset) = self.submitter.handle_response(request_id, response, now)
                    {
                        // Reset the new leader's sequencing with an immediate
                        // keep-alive; resubmission follows its response.
                        self.pending_reset = Some(reset);
                        self.send_keepalive(now);
                    }
                    if reconnect {
                        debug!("Server can't serve us, reconnecting");
                        self.handle_disconnect(now);
                    }
                }
            }
            ServerFrame::Publish(publish) => self.handle_publish(publish),
        }
        Ok(())
    }

    /// Handles a keep-alive response: refreshes the member view, performs a
    /// deferred resubmission, and detects session expiry.
    fn handle_keepalive_response(&mut self, response: Result<Response>, now: Instant) {
        match response {
            Ok(Response::KeepAlive(keepalive)) => {
                let members = keepalive.members.iter().map(|m| m.client_address.clone()).collect();
                self.connection.update_members(keepalive.leader, members);
                if let Some(reset) = self.pending_reset.take() {
                    self.submitter.resubmit_after(reset.from_sequence, reset.attempt, now);
                }
            }
            Ok(response) => debug!("Unexpected keep-alive response {response:?}"),
            Err(Error::UnknownSession) => {
                warn!("Session expired by the cluster");
                self.state.borrow_mut().close(Error::UnknownSession);
                self.submitter.abort_all(Error::UnknownSession);
            }
            Err(err) => {
                debug!("Keep-alive failed: {err}");
                if !is_operation_error(&err) {
                    self.handle_disconnect(now);
                }
                // Retry soon rather than waiting out the full interval.
                self.next_keepalive = now + Duration::from_secs(1);
            }
        }
    }

    /// Handles a pushed event batch: detects gaps in the event stream and
    /// asks the server to rewind, otherwise sequences the events for
    /// delivery relative to pending responses.
    fn handle_publish(&mut self, publish: crate::protocol::PublishRequest) {
        let received = self.state.borrow().event_index;
        if publish.previous_index != received {
            debug!(
                "Event gap: got batch at {} after {}, expected {received}; resetting",
                publish.event_index, publish.previous_index
            );
            let request = Request::Reset(ResetRequest { session: publish.session, index: received });
            if let Err(err) = self.send(request) {
                debug!("Event reset failed: {err}");
            }
            return;
        }
        self.state.borrow_mut().event_index = publish.event_index;

        let info = EventInfo {
            event_index: publish.event_index,
            previous_index: publish.previous_index,
        };
        let handler = self.on_event.clone();
        let events = publish.events;
        self.submitter.sequencer().sequence_event(
            info,
            Box::new(move || {
                if let Some(handler) = handler {
                    let mut handler = handler.borrow_mut();
                    for event in events {
                        handler(event);
                    }
                }
            }),
        );
    }

    /// Handles a lost connection: all in-flight work is rescheduled with
    /// backoff.
    fn handle_disconnect(&mut self, now: Instant) {
        self.connection.disconnect();
        self.in_flight.clear();
        self.keepalive_frame = None;
        self.submitter.handle_disconnect(now);
    }

    /// Closes the session: best-effort unregister, then fail anything left.
    fn close(&mut self) {
        let session = self.state.borrow().session;
        if session > 0 && self.state.borrow().is_open() {
            let request = Request::Unregister(UnregisterRequest { session });
            let result = {
                let mut state = self.state.borrow_mut();
                self.connection
                    .connect(&mut state)
                    .and_then(|conn| conn.call(request, Duration::from_secs(1)))
            };
            if let Err(err) = result {
                debug!("Unregister failed: {err}");
            }
        }
        self.state.borrow_mut().close(Error::ClosedSession);
        self.submitter.abort_all(Error::ClosedSession);
        self.connection.disconnect();
    }
}
