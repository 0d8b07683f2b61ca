use super::selector::AddressSelector;
use super::session::SessionState;
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::protocol::{ClientFrame, ConnectRequest, Request, Response, ServerFrame};

use log::debug;
use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::net::TcpStream;
use std::time::Duration;

/// A single server connection: a framed request/response stream with pushed
/// event frames interleaved.
pub struct ServerConnection {
    reader: std::io::BufReader<TcpStream>,
    writer: std::io::BufWriter<TcpStream>,
    /// The next frame id on this connection.
    next_frame: u64,
    /// Frames received while waiting for a specific response (e.g. pushed
    /// events during a handshake), delivered before reading the socket.
    pending: VecDeque<ServerFrame>,
}

impl ServerConnection {
    /// Connects to a server address.
    fn connect(address: &str) -> Result<Self> {
        let socket = TcpStream::connect(address)?;
        socket.set_nodelay(true)?;
        let reader = std::io::BufReader::new(socket.try_clone()?);
        let writer = std::io::BufWriter::new(socket);
        Ok(Self { reader, writer, next_frame: 0, pending: VecDeque::new() })
    }

    /// Sends a request, returning the frame id to correlate its response.
    pub fn send(&mut self, request: Request) -> Result<u64> {
        self.next_frame += 1;
        let id = self.next_frame;
        ClientFrame { id, request }.encode_into(&mut self.writer)?;
        self.writer.flush()?;
        Ok(id)
    }

    /// Receives the next frame, waiting at most the given duration. Returns
    /// None on timeout; a closed connection is an error.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<ServerFrame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        self.reader.get_ref().set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match ServerFrame::maybe_decode_from(&mut self.reader) {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(Error::IO("connection closed".into())),
            Err(err) if is_timeout(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Sends a request and blocks for its response, buffering any pushed
    /// frames that arrive first. Used for connection handshakes.
    pub fn call(&mut self, request: Request, timeout: Duration) -> Result<Response> {
        let id = self.send(request)?;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .ok_or_else(|| Error::IO("request timed out".into()))?;
            match self.recv_timeout(remaining)? {
                Some(ServerFrame::Response { id: frame, response }) if frame == id => {
                    return response;
                }
                Some(frame) => self.pending.push_back(frame),
                None => continue,
            }
        }
    }
}

/// Returns true if an I/O error is a read timeout rather than a broken
/// connection.
fn is_timeout(err: &Error) -> bool {
    matches!(err, Error::IO(msg) if msg.contains("timed out")
        || msg.contains("would block")
        || msg.contains("temporarily unavailable"))
}

/// Returns true if a response error is an operation-level outcome for the
/// submitter to handle, rather than a sign the contacted server can't serve
/// us (which triggers reconnection to the next member).
pub fn is_operation_error(error: &Error) -> bool {
    matches!(
        error,
        Error::CommandGap { .. }
            | Error::QueryGap
            | Error::Application(_)
            | Error::UnknownClient
            | Error::UnknownSession
            | Error::UnknownStateMachine
            | Error::Internal(_)
    )
}

/// A per-address connection cache.
#[derive(Default)]
pub struct ConnectionManager {
    connections: HashMap<String, ServerConnection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self { connections: HashMap::new() }
    }

    /// Returns the cached connection for an address, establishing one if
    /// necessary.
    pub fn get(&mut self, address: &str) -> Result<&mut ServerConnection> {
        if !self.connections.contains_key(address) {
            let connection = ServerConnection::connect(address)?;
            self.connections.insert(address.to_string(), connection);
        }
        Ok(self.connections.get_mut(address).expect("just inserted"))
    }

    /// Drops the cached connection for an address.
    pub fn remove(&mut self, address: &str) {
        self.connections.remove(address);
    }
}

/// The client's cluster connection: locates a live leader by iterating the
/// cluster members, binds the session to it, and carries requests until the
/// connection fails or a response indicates the leader moved.
pub struct Connection {
    manager: ConnectionManager,
    selector: AddressSelector,
    /// The address of the established connection, if any.
    current: Option<String>,
    /// The handshake timeout.
    timeout: Duration,
}

impl Connection {
    /// Creates a connection over the given cluster member addresses.
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self {
            manager: ConnectionManager::new(),
            selector: AddressSelector::new(servers),
            current: None,
            timeout,
        }
    }

    /// Returns the current leader hint.
    pub fn leader(&self) -> Option<&str> {
        self.selector.leader()
    }

    /// Updates the leader hint and membership from a server response.
    pub fn update_members(&mut self, leader: Option<String>, servers: Vec<String>) {
        self.selector.reset_with(leader, servers);
    }

    /// Returns true if a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    /// Drops the current connection, e.g. after an error or a response
    /// showing this server can't serve us. The next send reconnects.
    pub fn disconnect(&mut self) {
        if let Some(address) = self.current.take() {
            debug!("Disconnecting from {address}");
            self.manager.remove(&address);
        }
    }

    /// Returns the established connection, connecting if necessary: iterates
    /// candidate addresses (leader hint first), performing the connect
    /// handshake on each until one succeeds. Fails once every known address
    /// has been tried.
    pub fn connect(&mut self, state: &mut SessionState) -> Result<&mut ServerConnection> {
        if let Some(address) = self.current.clone() {
            return self.manager.get(&address);
        }

        self.selector.reset();
        while let Some(address) = self.selector.next() {
            debug!("Connecting to {address}");
            let connection = match self.manager.get(&address) {
                Ok(connection) => connection,
                Err(err) => {
                    debug!("Failed to connect to {address}: {err}");
                    self.manager.remove(&address);
                    continue;
                }
            };

            // Bind the session (if any) to this server, and learn its view
            // of the leader and membership.
            let request = Request::Connect(ConnectRequest {
                client: state.client.clone(),
                session: state.session,
                connection: state.next_connection(),
            });
            match connection.call(request, self.timeout) {
                Ok(Response::Connect(connect)) => {
                    let members =
                        connect.members.iter().map(|m| m.client_address.clone()).collect();
                    self.selector.reset_with(connect.leader, members);
                    self.current = Some(address.clone());
                    return self.manager.get(&address);
                }
                Ok(response) => {
                    debug!("Unexpected connect response from {address}: {response:?}");
                    self.manager.remove(&address);
                }
                Err(err) => {
                    debug!("Connect handshake with {address} failed: {err}");
                    self.manager.remove(&address);
                }
            }
        }
        Err(Error::IO("failed to connect to the cluster".into()))
    }

    /// Re-binds the session on the established connection, e.g. right after
    /// registration assigned a session id. Updates the member view from the
    /// response.
    pub fn rebind(&mut self, state: &mut SessionState) -> Result<()> {
        let timeout = self.timeout;
        let request = Request::Connect(ConnectRequest {
            client: state.client.clone(),
            session: state.session,
            connection: state.next_connection(),
        });
        let connection = self.connect(state)?;
        match connection.call(request, timeout) {
            Ok(Response::Connect(connect)) => {
                let members = connect.members.iter().map(|m| m.client_address.clone()).collect();
                self.selector.reset_with(connect.leader, members);
                Ok(())
            }
            Ok(response) => {
                self.disconnect();
                Err(Error::Internal(format!("unexpected connect response {response:?}")))
            }
            Err(err) => {
                self.disconnect();
                Err(err)
            }
        }
    }

    /// Sends a request to the cluster, reconnecting as needed. Returns the
    /// frame id to correlate the response.
    pub fn send(&mut self, state: &mut SessionState, request: Request) -> Result<u64> {
        loop {
            let connection = self.connect(state)?;
            match connection.send(request.clone()) {
                Ok(id) => return Ok(id),
                Err(err) => {
                    debug!("Send failed, reconnecting: {err}");
                    self.disconnect();
                }
            }
        }
    }

    /// Receives the next frame from the current connection, waiting at most
    /// the given duration. Returns None when idle or disconnected; a broken
    /// connection is dropped and surfaced as an error so in-flight requests
    /// can be rescheduled.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<ServerFrame>> {
        let Some(address) = self.current.clone() else {
            std::thread::sleep(timeout);
            return Ok(None);
        };
        let connection = self.manager.get(&address)?;
        match connection.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.disconnect();
                Err(err)
            }
        }
    }
}
