mod candidate;
mod follower;
mod leader;
mod passive;

use super::{
    Address, Entry, EntryKind, Envelope, Index, Log, Member, MemberType, Message, RequestId,
    COMPACT_THRESHOLD, ELECTION_TIMEOUT_RANGE, TICK_INTERVAL,
};
use crate::error::{Error, Result};
use crate::protocol::{self, Response};
use crate::session::{Applied, Driver, SessionId};
pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;
pub use passive::{Inactive, Passive, Reserve};

use itertools::Itertools as _;
use log::debug;
use rand::Rng as _;

/// Dispatches to the inner RawNode of any role.
macro_rules! with_rawnode {
    ($node:expr, $n:ident => $expr:expr) => {
        match $node {
            Node::Candidate($n) => $expr,
            Node::Follower($n) => $expr,
            Node::Leader($n) => $expr,
            Node::Passive($n) => $expr,
            Node::Reserve($n) => $expr,
            Node::Inactive($n) => $expr,
        }
    };
}
use with_rawnode;

/// A node ID.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// The tick interval in clock milliseconds, used to advance the node clock.
pub(crate) const TICK_MILLIS: u64 = TICK_INTERVAL.as_millis() as u64;

/// Generates a randomized election timeout.
fn rand_election_timeout() -> Ticks {
    rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE)
}

/// A cluster node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the node_tx
/// channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
    Passive(RawNode<Passive>),
    Reserve(RawNode<Reserve>),
    Inactive(RawNode<Inactive>),
}

impl Node {
    /// Creates a new node, assuming the role its member type prescribes. An
    /// active node starts as a leaderless follower, or becomes leader
    /// immediately if it is the only active member. The clock is the current
    /// wall time in milliseconds; it only advances by ticks thereafter.
    pub fn new(
        id: NodeID,
        members: Vec<Member>,
        log: Log,
        driver: Driver,
        node_tx: crossbeam::channel::Sender<Envelope>,
        clock: u64,
    ) -> Result<Self> {
        let node = RawNode {
            id,
            members,
            term: 0,
            log,
            driver,
            node_tx,
            clock,
            config_index: 0,
            role: Follower::new(None, None),
        };
        let (term, vote) = node.log.get_term();
        let mut node = RawNode { term, role: Follower::new(None, vote), ..node };
        match node.my_type() {
            MemberType::Active => {
                if node.peers().is_empty() {
                    // The only active member may become leader immediately.
                    return Ok(node.into_candidate()?.into_leader()?.into());
                }
                Ok(node.into())
            }
            MemberType::Passive => Ok(node.into_role(Passive::new()).into()),
            MemberType::Reserve => Ok(node.into_role(Reserve::new()).into()),
            MemberType::Inactive => Ok(node.into_role(Inactive).into()),
        }
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        with_rawnode!(self, n => n.id)
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        with_rawnode!(self, n => n.term)
    }

    /// Returns server status for introspection.
    pub fn status(&self) -> protocol::Status {
        let mut status = with_rawnode!(self, n => n.status());
        status.leader = self.leader_hint();
        status
    }

    /// Returns the node's current view of the leader, if any.
    pub fn leader_hint(&self) -> Option<NodeID> {
        match self {
            Node::Leader(n) => Some(n.id),
            Node::Follower(n) => n.role.leader,
            _ => None,
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
            Node::Passive(n) => n.step(msg),
            Node::Reserve(n) => n.step(msg),
            Node::Inactive(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
            Node::Passive(n) => n.tick(),
            Node::Reserve(n) => Ok(Node::Reserve(n.advance_clock())),
            Node::Inactive(n) => Ok(Node::Inactive(n.advance_clock())),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

impl From<RawNode<Passive>> for Node {
    fn from(n: RawNode<Passive>) -> Self {
        Node::Passive(n)
    }
}

impl From<RawNode<Reserve>> for Node {
    fn from(n: RawNode<Reserve>) -> Self {
        Node::Reserve(n)
    }
}

impl From<RawNode<Inactive>> for Node {
    fn from(n: RawNode<Inactive>) -> Self {
        Node::Inactive(n)
    }
}

/// A node role: leader, follower, candidate, passive, reserve, or inactive.
pub trait Role: std::fmt::Debug {}

/// A node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>. See:
/// http://cliffle.com/blog/rust-typestate/
pub struct RawNode<R: Role = Follower> {
    pub(crate) id: NodeID,
    pub(crate) members: Vec<Member>,
    pub(crate) term: Term,
    pub(crate) log: Log,
    pub(crate) driver: Driver,
    pub(crate) node_tx: crossbeam::channel::Sender<Envelope>,
    /// The node's clock in milliseconds, advanced by ticks. Used to stamp
    /// entries on the leader; replicas apply the stamps deterministically.
    pub(crate) clock: u64,
    /// The log index of the applied cluster configuration, 0 for the
    /// bootstrap configuration.
    pub(crate) config_index: Index,
    pub(crate) role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    pub(crate) fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            members: self.members,
            term: self.term,
            log: self.log,
            driver: self.driver,
            node_tx: self.node_tx,
            clock: self.clock,
            config_index: self.config_index,
            role,
        }
    }

    /// Advances the node clock by one tick.
    pub(crate) fn advance_clock(mut self) -> Self {
        self.clock += TICK_MILLIS;
        self
    }

    /// Returns this node's member type per the current configuration. A node
    /// absent from the configuration is inactive.
    pub(crate) fn my_type(&self) -> MemberType {
        self.type_of(self.id)
    }

    /// Returns a member's type per the current configuration.
    pub(crate) fn type_of(&self, id: NodeID) -> MemberType {
        self.members
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.member_type)
            .unwrap_or(MemberType::Inactive)
    }

    /// Returns the IDs of all active members except this node, i.e. the
    /// voters it campaigns against and replicates to. Sorted for determinism.
    pub(crate) fn peers(&self) -> Vec<NodeID> {
        self.members_of_type(MemberType::Active)
    }

    /// Returns the IDs of all members that receive log replication (active
    /// and passive), except this node.
    pub(crate) fn replicas(&self) -> Vec<NodeID> {
        let mut ids = self.members_of_type(MemberType::Active);
        ids.extend(self.members_of_type(MemberType::Passive));
        ids.sort_unstable();
        ids
    }

    /// Returns the IDs of all members that only receive configuration and
    /// snapshot installs (reserves), except this node.
    pub(crate) fn reserves(&self) -> Vec<NodeID> {
        self.members_of_type(MemberType::Reserve)
    }

    fn members_of_type(&self, member_type: MemberType) -> Vec<NodeID> {
        self.members
            .iter()
            .filter(|m| m.member_type == member_type && m.id != self.id)
            .map(|m| m.id)
            .sorted()
            .collect()
    }

    /// Returns the client-facing address of a member, if known.
    pub(crate) fn client_address_of(&self, id: NodeID) -> Option<String> {
        self.members.iter().find(|m| m.id == id).map(|m| m.client_address.clone())
    }

    /// Returns the quorum size of the cluster: a strict majority of active
    /// voting members (including this node if active).
    pub(crate) fn quorum_size(&self) -> u64 {
        let active =
            self.members.iter().filter(|m| m.member_type == MemberType::Active).count() as u64;
        active / 2 + 1
    }

    /// Returns the quorum value of the given unsorted slice, in descending
    /// order. The slice must have one value per active voting member.
    pub(crate) fn quorum_value<T: Ord + Copy>(&self, values: Vec<T>) -> T {
        quorum_value(values, self.quorum_size())
    }

    /// Sends a message to another node or a client.
    pub(crate) fn send(&self, to: Address, message: Message) -> Result<()> {
        let msg = Envelope { from: Address::Node(self.id), to, term: self.term, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Sends a message to each of the given nodes.
    pub(crate) fn send_to_all(&self, to: &[NodeID], message: Message) -> Result<()> {
        for id in to.iter().copied() {
            self.send(Address::Node(id), message.clone())?;
        }
        Ok(())
    }

    /// Responds to a client request routed through this node.
    pub(crate) fn respond(&self, id: RequestId, response: Result<Response>) -> Result<()> {
        self.send(Address::Client, Message::ClientResponse { id, response })
    }

    /// Applies any pending committed entries to the state machine driver,
    /// returning their outcomes. Configuration entries update the node's
    /// membership view as a side effect; the caller must reconcile its role
    /// against the new configuration. Event batches are pushed out for
    /// delivery; the server glue routes them to sessions connected to this
    /// server and drops the rest, since every replica produces the same
    /// events but only the connected server may deliver them.
    pub(crate) fn maybe_apply(&mut self) -> Result<Vec<Applied>> {
        let commit_index = self.log.get_commit_index().0;
        let mut out = Vec::new();
        while self.driver.applied_index() < commit_index {
            let index = self.driver.applied_index() + 1;
            let entry = self
                .log
                .get(index)?
                .ok_or_else(|| Error::Internal(format!("missing committed entry {index}")))?;
            if let EntryKind::Configuration { members } = &entry.kind {
                debug!("Applying configuration {members:?}");
                self.members = members.clone();
                self.config_index = entry.index;
            }
            out.extend(self.driver.apply(entry)?);
        }
        for applied in &out {
            if let Applied::Publish(publish) = applied {
                self.send(Address::Client, Message::Publish(publish.clone()))?;
            }
        }
        Ok(out)
    }

    /// Takes a state machine snapshot and compacts the log if enough applied
    /// entries have accumulated above the compaction point. The bound caps
    /// compaction so members that are merely lagging (at or above the bound)
    /// can still catch up by replication rather than snapshot install.
    pub(crate) fn maybe_compact(&mut self, bound: Index) -> Result<()> {
        let applied = self.driver.applied_index();
        let first = self.log.first_index();
        let to = applied.min(bound);
        if to < first || to - first + 1 < COMPACT_THRESHOLD {
            return Ok(());
        }
        let last_term = self
            .log
            .get(to)?
            .map(|e| e.term)
            .ok_or_else(|| Error::Internal(format!("missing entry {to} for snapshot")))?;
        debug!("Taking snapshot through index {to}");
        let data = self.driver.snapshot()?;
        self.log.take_snapshot(super::Snapshot { last_index: to, last_term, data })
    }

    /// Builds a connect response with this node's view of the leader and
    /// membership. Any role answers these, so clients can locate the leader.
    pub(crate) fn connect_response(&self, leader: Option<NodeID>) -> Response {
        Response::Connect(protocol::ConnectResponse {
            leader: leader.and_then(|id| self.client_address_of(id)),
            members: self.members.clone(),
        })
    }

    /// Handles the client requests every role serves: connect (leader
    /// discovery), status, and event resets. Returns the request back if it
    /// must be handled by the role itself.
    pub(crate) fn step_common_request(
        &mut self,
        id: RequestId,
        request: protocol::Request,
        leader: Option<NodeID>,
    ) -> Result<Option<(RequestId, protocol::Request)>> {
        match request {
            protocol::Request::Connect(connect) => {
                // The server glue binds the session to the client connection;
                // the node only reports its view of the cluster.
                let _ = connect;
                self.respond(id, Ok(self.connect_response(leader)))?;
                Ok(None)
            }
            protocol::Request::Status => {
                let mut status = self.status();
                status.leader = leader;
                self.respond(id, Ok(Response::Status(status)))?;
                Ok(None)
            }
            protocol::Request::Reset(reset) => {
                match self.driver.reset_events(reset.session, reset.index) {
                    Ok(publishes) => {
                        for publish in publishes {
                            self.send(Address::Client, Message::Publish(publish))?;
                        }
                        self.respond(id, Ok(Response::Reset))?;
                    }
                    Err(err) => self.respond(id, Err(err))?,
                }
                Ok(None)
            }
            request => Ok(Some((id, request))),
        }
    }

    /// Returns server status, without a leader (filled in by the role).
    pub(crate) fn status(&self) -> protocol::Status {
        protocol::Status {
            server: self.id,
            term: self.term,
            leader: None,
            last_index: self.log.get_last_index().0,
            commit_index: self.log.get_commit_index().0,
            apply_index: self.driver.applied_index(),
            sessions: self.driver.sessions().len(),
        }
    }

    /// Asserts message invariants when stepping.
    pub(crate) fn assert_step(&self, msg: &Envelope) {
        match msg.to {
            Address::Node(id) => assert_eq!(id, self.id, "message to other node"),
            Address::Broadcast | Address::Client => {}
        }
    }
}

/// Returns the quorum (median) value of the given unsorted slice, in
/// descending order. The slice cannot be empty.
fn quorum_value<T: Ord + Copy>(mut values: Vec<T>, quorum_size: u64) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size as usize - 1;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}

/// An in-progress snapshot install, assembled from leader-streamed chunks
/// next to the committed snapshot and promoted atomically when complete.
#[derive(Debug)]
pub(crate) struct Installing {
    pub id: u64,
    pub index: Index,
    pub last_term: Term,
    pub data: Vec<u8>,
}

impl<R: Role> RawNode<R> {
    /// Handles a snapshot install chunk, assembling the snapshot in the given
    /// role-owned buffer and promoting it when complete. Returns the response
    /// to send to the leader.
    pub(crate) fn step_install(
        &mut self,
        installing: &mut Option<Installing>,
        id: u64,
        index: Index,
        last_term: Term,
        offset: u64,
        data: Vec<u8>,
        complete: bool,
    ) -> Result<Message> {
        // A snapshot at or below our commit index has nothing to offer; play
        // along so the leader finishes the transfer and resumes replication.
        if index <= self.log.get_commit_index().0 {
            return Ok(Message::InstallResponse {
                succeeded: true,
                offset: offset + data.len() as u64,
            });
        }

        // Restart assembly on a new transfer id or an offset mismatch.
        let assembly = match installing {
            Some(assembly) if assembly.id == id && assembly.data.len() as u64 == offset => assembly,
            _ if offset == 0 => {
                *installing = Some(Installing { id, index, last_term, data: Vec::new() });
                installing.as_mut().expect("just installed")
            }
            _ => {
                let have = installing.as_ref().map(|i| i.data.len() as u64).unwrap_or(0);
                return Ok(Message::InstallResponse { succeeded: false, offset: have });
            }
        };
        assembly.data.extend(data);
        let received = assembly.data.len() as u64;

        if complete {
            let snapshot = super::Snapshot {
                last_index: assembly.index,
                last_term: assembly.last_term,
                data: std::mem::take(&mut assembly.data),
            };
            *installing = None;
            debug!("Installing snapshot through index {}", snapshot.last_index);
            self.driver.restore(&snapshot.data)?;
            self.log.install_snapshot(snapshot)?;
        }
        Ok(Message::InstallResponse { succeeded: true, offset: received })
    }
}
