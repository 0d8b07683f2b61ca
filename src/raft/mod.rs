mod log;
mod message;
mod node;
mod quorum;
mod server;

pub use self::log::{Entry, EntryKind, Index, Log, SessionAck, Snapshot};
pub use message::{Address, Envelope, Member, MemberType, Message, RequestId};
pub use node::{Node, NodeID, Term, Ticks};
pub use quorum::Quorum;
pub use server::Server;

/// The interval between Raft ticks, the unit of time for elections,
/// heartbeats, and session bookkeeping.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// The randomized election timeout range, in ticks. A follower waits between
/// the lower and upper bound without hearing from a leader before it polls its
/// peers for an election.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The interval between leader heartbeats (empty appends), in ticks.
pub const HEARTBEAT_INTERVAL: Ticks = 5;

/// A leader steps down after this many ticks without a replication quorum,
/// since a different leader may have been elected in a partition.
pub const QUORUM_TIMEOUT: Ticks = 20;

/// The maximum number of log entries in a single replication batch.
pub const APPEND_BATCH_SIZE: u64 = 64;

/// The snapshot chunk size for install requests, in bytes.
pub const INSTALL_CHUNK_SIZE: usize = 64 * 1024;

/// The number of applied entries above the compaction point before a node
/// takes a new snapshot and compacts its log.
pub const COMPACT_THRESHOLD: u64 = 1024;
