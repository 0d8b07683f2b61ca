use super::{Entry, Index, NodeID, Term};
use crate::encoding;
use crate::error::Result;
use crate::protocol;

use serde_derive::{Deserialize, Serialize};

/// A message envelope addressed between cluster members or to a client.
/// Envelopes are the unit of transfer on peer connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: Address,
    /// The recipient.
    pub to: Address,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

impl encoding::Value for Envelope {}

/// A message address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    /// All cluster members that receive the message kind (e.g. appends go to
    /// active and passive members, configurations also to reserves).
    Broadcast,
    /// A specific cluster member.
    Node(NodeID),
    /// A client of the local server. The server glue routes these to the
    /// connection identified by the request id or session.
    Client,
}

impl Address {
    /// Unwraps the node ID, panicking on other address kinds. Used where the
    /// sender is known to be a cluster member.
    pub fn unwrap_node(&self) -> NodeID {
        match self {
            Address::Node(id) => *id,
            addr => panic!("expected node address, got {addr:?}"),
        }
    }
}

/// A cluster member's participation type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    /// Votes in elections and counts toward the commit quorum.
    Active,
    /// Receives the replicated log but does not vote.
    Passive,
    /// Receives configuration and snapshot installs only.
    Reserve,
    /// Does not participate; the initial and terminal member state.
    Inactive,
}

/// A cluster member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The member's node ID.
    pub id: NodeID,
    /// The address peers use for cluster traffic, e.g. "10.0.0.1:9705".
    pub address: String,
    /// The address clients use for sessions, e.g. "10.0.0.1:9605".
    pub client_address: String,
    /// The member's participation type.
    pub member_type: MemberType,
}

/// A client request ID, unique for the duration of the request.
pub type RequestId = Vec<u8>;

/// A message passed between cluster members, or routing a client operation
/// through the local node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Leaders replicate log entries to followers and passive members. An
    /// empty entry set serves as a heartbeat, sent at a fixed tick interval.
    Append {
        /// The index of the entry immediately preceding the batch.
        base_index: Index,
        /// The term of the entry immediately preceding the batch.
        base_term: Term,
        /// The leader's commit index.
        commit_index: Index,
        /// The highest index known to be stored on every member. Entries at
        /// or below it may safely be compacted anywhere.
        global_index: Index,
        /// The leader's read sequence number, confirming leadership for
        /// linearizable queries when a quorum echoes it back.
        read_seq: u64,
        /// The entries to replicate.
        entries: Vec<Entry>,
    },
    /// Followers accept or reject an append based on the base position, and
    /// report their resulting last index.
    AppendResponse {
        /// Whether the base position matched and the entries were spliced.
        succeeded: bool,
        /// The follower's last log index after the splice (or its current
        /// last index on rejection, to help the leader probe).
        last_index: Index,
        /// Echoes the read sequence number from the append.
        read_seq: u64,
    },

    /// Candidates solicit votes from all active members when campaigning.
    Vote {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },
    /// Voters grant or withhold their vote for the envelope's term.
    VoteResponse { granted: bool },

    /// A follower that reached its election timeout polls its peers with its
    /// current term and log position before starting a real election. Only if
    /// a majority would vote for it does it become a candidate, which
    /// prevents a partitioned member from inflating the term on reconnect.
    Poll {
        /// The index of the poller's last log entry.
        last_index: Index,
        /// The term of the poller's last log entry.
        last_term: Term,
    },
    /// Peers accept a poll if they would vote for the poller in a real
    /// election at the polled term.
    PollResponse { accepted: bool },

    /// Leaders stream a snapshot to members whose log position has been
    /// compacted away, in chunks.
    Install {
        /// Identifies the snapshot transfer; a new transfer restarts it.
        id: u64,
        /// The index of the last entry covered by the snapshot.
        index: Index,
        /// The term of the last entry covered by the snapshot.
        last_term: Term,
        /// The byte offset of this chunk within the snapshot.
        offset: u64,
        /// The chunk data.
        data: Vec<u8>,
        /// Whether this is the final chunk.
        complete: bool,
    },
    /// Members acknowledge each chunk, reporting the next offset they expect.
    InstallResponse { succeeded: bool, offset: u64 },

    /// Leaders push the cluster configuration to passive and reserve members,
    /// which do not learn it through the log.
    Configure { index: Index, members: Vec<Member> },
    /// Members acknowledge a configuration at the given index.
    ConfigureResponse { index: Index },

    /// A client request, submitted to the local node by the server glue.
    ClientRequest { id: RequestId, request: protocol::Request },
    /// A client response, routed back through the server glue.
    ClientResponse { id: RequestId, response: Result<protocol::Response> },
    /// A server-pushed event batch for a session connected to this server.
    Publish(protocol::PublishRequest),
}
