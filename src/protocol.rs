//! The client↔server protocol. Requests and responses are bincode-encoded
//! over the client connection; the transport framing itself lives in the
//! server glue and the client connection.

use crate::encoding;
use crate::error::Result;
use crate::raft::{Index, Member, NodeID, Term};
use crate::session::SessionId;

use serde_derive::{Deserialize, Serialize};

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Binds the client's connection to this server, optionally for an
    /// existing session. Any server answers with its view of the leader and
    /// membership, so clients can locate the leader by iterating members.
    Connect(ConnectRequest),
    /// Registers a new session. Leader only.
    Register(RegisterRequest),
    /// Keeps a session alive, acknowledging received responses and events.
    KeepAlive(KeepAliveRequest),
    /// Closes a session. Leader only.
    Unregister(UnregisterRequest),
    /// Submits a session command. Leader only.
    Command(CommandRequest),
    /// Submits a session query. Leader only; not logged.
    Query(QueryRequest),
    /// Acknowledges or rewinds event delivery for a session.
    Reset(ResetRequest),
    /// Replaces the cluster configuration, committed through the log like
    /// any other entry. Leader only.
    Reconfigure(Vec<Member>),
    /// Fetches server status.
    Status,
}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Connect(ConnectResponse),
    Register(RegisterResponse),
    KeepAlive(KeepAliveResponse),
    Unregister,
    Command(CommandResponse),
    Query(QueryResponse),
    Reset,
    /// The log index at which the new configuration was committed.
    Reconfigure(Index),
    Status(Status),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// The client's unique identity.
    pub client: String,
    /// The session to bind to this server, or 0 if none yet.
    pub session: SessionId,
    /// The client's connection attempt counter, distinguishing stale
    /// connections after reconnects.
    pub connection: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// The address of the current leader, if known.
    pub leader: Option<String>,
    /// The current cluster membership.
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The client's unique identity.
    pub client: String,
    /// The requested session timeout in milliseconds.
    pub timeout: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The registered session id (the index of the register entry).
    pub session: SessionId,
    /// The granted session timeout in milliseconds.
    pub timeout: u64,
    /// The address of the current leader, if known.
    pub leader: Option<String>,
    /// The current cluster membership.
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    /// The session to keep alive.
    pub session: SessionId,
    /// The highest command sequence number whose response the client has
    /// received. The server prunes its result cache below it.
    pub command_sequence: u64,
    /// The highest event index the client has processed. The server prunes
    /// acknowledged event batches below it.
    pub event_index: Index,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    /// The address of the current leader, if known.
    pub leader: Option<String>,
    /// The current cluster membership.
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session: SessionId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// The session submitting the command.
    pub session: SessionId,
    /// The client-assigned, per-session sequence number, starting at 1.
    pub sequence: u64,
    /// The opaque command for the state machine. None is a no-op fill,
    /// submitted by the client to keep the sequence space dense after it
    /// abandons a command; it consumes the sequence number without invoking
    /// the state machine.
    pub command: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// The log index at which the command was applied.
    pub index: Index,
    /// The session's highest published event index at apply time. The client
    /// sequencer delivers all events at or below it before this response.
    pub event_index: Index,
    /// The session's highest applied sequence number.
    pub last_sequence: u64,
    /// The state machine result. A state machine failure is carried here as
    /// Error::Application: the command still consumed its sequence number.
    pub result: Result<Vec<u8>>,
}

/// Query consistency levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Observes state as of commit up to a heartbeat-confirmed instant. The
    /// leader confirms its leadership with a quorum round before answering.
    Linearizable,
    /// Observes some state at least as fresh as the client has already seen,
    /// without a confirmation round.
    Sequential,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The session submitting the query.
    pub session: SessionId,
    /// The session's current command sequence number, for ordering against
    /// in-flight commands.
    pub sequence: u64,
    /// The highest log index the client has observed in responses. The query
    /// waits until at least this much state is applied.
    pub index: Index,
    /// The opaque query for the state machine.
    pub query: Vec<u8>,
    /// The requested consistency level.
    pub consistency: Consistency,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// The applied log index the query observed.
    pub index: Index,
    /// The session's highest published event index.
    pub event_index: Index,
    /// The state machine result.
    pub result: Vec<u8>,
}

/// A server-pushed batch of session events, produced during a command apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// The session the events belong to.
    pub session: SessionId,
    /// The log index of the command whose apply produced the events.
    pub event_index: Index,
    /// The session's previous event index, for client-side gap detection.
    pub previous_index: Index,
    /// The event payloads.
    pub events: Vec<Vec<u8>>,
}

/// Rewinds event delivery for a session to the given index, forcing the
/// server to resend later batches. Sent by the client on gap detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    pub session: SessionId,
    /// The highest event index the client has processed.
    pub index: Index,
}

/// Server status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The responding server.
    pub server: NodeID,
    /// The current Raft term.
    pub term: Term,
    /// The current leader, if known.
    pub leader: Option<NodeID>,
    /// The server's last log index.
    pub last_index: Index,
    /// The server's commit index.
    pub commit_index: Index,
    /// The server's applied index.
    pub apply_index: Index,
    /// The number of live sessions.
    pub sessions: u64,
}

/// A frame sent from a client to a server: a connection-local request id and
/// the request. Ids correlate pipelined responses on the same connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

/// A frame sent from a server to a client: either a response to a request on
/// this connection, or a pushed event batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Response { id: u64, response: Result<Response> },
    Publish(PublishRequest),
}

impl encoding::Value for Request {}
impl encoding::Value for Response {}
impl encoding::Value for PublishRequest {}
impl encoding::Value for ClientFrame {}
impl encoding::Value for ServerFrame {}
