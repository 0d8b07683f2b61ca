use super::{Member, NodeID, Term};
use crate::encoding::{self, bincode, Value as _};
use crate::error::{Error, Result};
use crate::session::SessionId;
use crate::storage;

use serde_derive::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry. Entries are immutable once written, and identified by a
/// gap-free 1-based index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The entry kind and payload.
    pub kind: EntryKind,
}

impl encoding::Value for Entry {}

/// A keep-alive acknowledgement for a single session, recording the highest
/// command response and event batch the client has seen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionAck {
    pub session: SessionId,
    pub command_sequence: u64,
    pub event_index: Index,
}

/// The kinds of log entries. Everything that mutates replicated state goes
/// through the log, including session lifecycle changes, so that all replicas
/// agree on session existence and expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A session command to apply to the state machine.
    Command { session: SessionId, sequence: u64, timestamp: u64, command: Vec<u8> },
    /// A cluster configuration change, committed like any other entry.
    Configuration { members: Vec<Member> },
    /// Registers a new client session. The session's id is the entry index.
    Register { client: String, timeout: u64, timestamp: u64 },
    /// Keep-alive acknowledgements for active sessions, stamped with the
    /// leader's clock so that expiry is deterministic on every replica.
    KeepAlive { acks: Vec<SessionAck>, timestamp: u64 },
    /// Removes a session, either at the client's request or because the
    /// leader expired it.
    Unregister { session: SessionId, expired: bool, timestamp: u64 },
    /// Binds a session to the server currently holding its connection, for
    /// event routing.
    Connect { session: SessionId, node: NodeID },
    /// A no-op command filling a sequence number abandoned by the client,
    /// keeping the session's sequence space dense.
    NoOp { session: SessionId, sequence: u64, timestamp: u64 },
    /// Appended by a new leader when it assumes leadership, to establish the
    /// commit floor for its term.
    Initialize { timestamp: u64 },
}

/// A state machine snapshot, covering the log up to and including last_index.
/// At most one committed snapshot is durable; an installing snapshot is
/// assembled separately and promoted atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last entry covered by the snapshot.
    pub last_index: Index,
    /// The term of the last entry covered by the snapshot.
    pub last_term: Term,
    /// The serialized state machine and session state.
    pub data: Vec<u8>,
}

impl encoding::Value for Snapshot {}

/// Log metadata keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Key {
    /// Stores the current term and vote (if any).
    TermVote,
    /// Stores the committed snapshot (if any).
    Snapshot,
}

impl Key {
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("key must encode")
    }
}

/// The replicated log. Wraps a storage::log::Store and tracks the current
/// term and vote, the last and committed entry positions, and the snapshot
/// covering the compacted prefix.
///
/// The log has the following invariants:
///
/// * Entry indexes are contiguous starting at 1 (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries are durable (flushed to disk).
/// * Appended entries use the current term.
/// * Committed entries are never changed or removed (no truncation below the
///   commit index), but may be compacted away once a snapshot covers them.
/// * Entries with the same index/term contain the same payload.
/// * If two logs contain a matching index/term, all previous entries are
///   identical (see section 5.3 in the Raft paper).
pub struct Log {
    /// The underlying storage. A trait object, to allow runtime selection of
    /// the store and avoid propagating generics throughout the Raft code.
    store: Box<dyn storage::log::Store>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The position of the durable snapshot, if any.
    snapshot: Option<(Index, Term)>,
}

impl Log {
    /// Initializes a log using the given storage, recovering position and
    /// metadata from it.
    pub fn new(store: Box<dyn storage::log::Store>) -> Result<Self> {
        let (term, vote) = store
            .get_metadata(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let snapshot = store
            .get_metadata(&Key::Snapshot.encode())?
            .map(|v| bincode::deserialize::<Snapshot>(&v))
            .transpose()?
            .map(|s| (s.last_index, s.last_term));
        let (last_index, last_term) = match store.is_empty() {
            true => snapshot.unwrap_or((0, 0)),
            false => {
                let index = store.last_index();
                let entry = store
                    .get(index)?
                    .map(|v| Entry::decode(&v))
                    .transpose()?
                    .ok_or_else(|| Error::Internal(format!("missing last entry {index}")))?;
                (entry.index, entry.term)
            }
        };
        let commit_index = store.committed().max(snapshot.map(|(i, _)| i).unwrap_or(0));
        let commit_term = match commit_index {
            0 => 0,
            i if Some(i) == snapshot.map(|(i, _)| i) => snapshot.map(|(_, t)| t).unwrap_or(0),
            i => store
                .get(i)?
                .map(|v| Entry::decode(&v))
                .transpose()?
                .map(|e| e.term)
                .ok_or_else(|| Error::Internal(format!("missing committed entry {i}")))?,
        };
        Ok(Self { store, term, vote, last_index, last_term, commit_index, commit_term, snapshot })
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        self.term = term;
        self.vote = vote;
        self.store.set_metadata(&Key::TermVote.encode(), bincode::serialize(&(term, vote))?)?;
        self.store.flush()
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the first index still present in the log, i.e. just past the
    /// compacted prefix. Entries between first and last index are always
    /// present.
    pub fn first_index(&self) -> Index {
        match self.snapshot {
            Some((index, _)) => index + 1,
            None => 1,
        }
    }

    /// Appends an entry of the given kind to the log, using the current term,
    /// and flushes it to storage.
    pub fn append(&mut self, kind: EntryKind) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, kind };
        let index = self.store.append(entry.encode()?)?;
        assert_eq!(index, entry.index, "appended entry index mismatch");
        self.store.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist (including
    /// compacted entries).
    pub fn get(&self, index: Index) -> Result<Option<Entry>> {
        self.store.get(index)?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Returns the term of the entry at the given index, if known: index 0
    /// has term 0, and the snapshot position retains its term after
    /// compaction.
    pub fn term_at(&self, index: Index) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if let Some((snapshot_index, snapshot_term)) = self.snapshot {
            if index == snapshot_index {
                return Ok(Some(snapshot_term));
            }
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Index 0 with term 0 always matches, as does the snapshot position.
    pub fn has(&self, index: Index, term: Term) -> Result<bool> {
        if index == 0 && term == 0 {
            return Ok(true);
        }
        if Some((index, term)) == self.snapshot {
            return Ok(true);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Iterates over log entries in the given index range.
    pub fn scan(&self, range: impl std::ops::RangeBounds<Index>) -> Scan<'_> {
        Box::new(
            self.store
                .scan(storage::log::to_bounds(range))
                .map(|r| r.and_then(|v| Entry::decode(&v))),
        )
    }

    /// Commits entries up to and including the given index. The index must
    /// exist, and the commit index can't regress.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        let entry = self
            .get(index)?
            .ok_or_else(|| Error::Internal(format!("can't commit non-existent index {index}")))?;
        if index < self.commit_index {
            return Err(Error::Internal(format!(
                "commit index regression {} → {}",
                self.commit_index, index
            )));
        }
        if index == self.commit_index {
            return Ok(index);
        }
        self.store.commit(index)?;
        self.commit_index = entry.index;
        self.commit_term = entry.term;
        Ok(index)
    }

    /// Splices a contiguous set of entries into the log. The entries must
    /// connect to the existing log (no index gaps), and any existing entries
    /// that conflict by term are truncated away before the rest is appended.
    /// Entries that are already present with matching terms are skipped.
    /// Committed entries can't be replaced. Returns the new last index.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index);
        };
        assert!(first.index > 0, "spliced entry index can't be 0");
        assert_eq!(
            last.index - first.index + 1,
            entries.len() as u64,
            "spliced entries must be contiguous"
        );
        if first.index > self.last_index + 1 {
            return Err(Error::Internal(format!(
                "spliced entries must connect to the log at {}",
                self.last_index + 1
            )));
        }

        // Skip entries that are already present with matching terms, then
        // truncate any conflicting suffix and append the remainder.
        let mut entries = entries.into_iter();
        for entry in entries.by_ref() {
            match self.get(entry.index)? {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) | None => {
                    if entry.index <= self.commit_index {
                        return Err(Error::Internal(format!(
                            "spliced entry {} conflicts with committed entry",
                            entry.index
                        )));
                    }
                    if entry.index <= self.last_index {
                        self.store.truncate(entry.index - 1)?;
                    }
                    let index = self.store.append(entry.encode()?)?;
                    assert_eq!(index, entry.index, "spliced entry index mismatch");
                    self.last_index = entry.index;
                    self.last_term = entry.term;
                    break;
                }
            }
        }
        for entry in entries {
            let index = self.store.append(entry.encode()?)?;
            assert_eq!(index, entry.index, "spliced entry index mismatch");
            self.last_index = entry.index;
            self.last_term = entry.term;
        }
        self.store.flush()?;
        Ok(self.last_index)
    }

    /// Returns the durable snapshot, if any.
    pub fn snapshot(&self) -> Result<Option<Snapshot>> {
        self.store
            .get_metadata(&Key::Snapshot.encode())?
            .map(|v| Snapshot::decode(&v))
            .transpose()
    }

    /// Persists a snapshot taken at a committed, applied index, then compacts
    /// the log prefix it covers.
    pub fn take_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        assert!(
            snapshot.last_index <= self.commit_index,
            "snapshot index {} above commit index {}",
            snapshot.last_index,
            self.commit_index
        );
        self.store.set_metadata(&Key::Snapshot.encode(), snapshot.encode()?)?;
        self.store.compact(snapshot.last_index)?;
        self.store.flush()?;
        self.snapshot = Some((snapshot.last_index, snapshot.last_term));
        Ok(())
    }

    /// Installs a snapshot received from a leader, replacing the entire log
    /// prefix it covers. Used when the leader has compacted away entries this
    /// node still needs. Returns the snapshot position.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(Index, Term)> {
        assert!(
            snapshot.last_index > self.commit_index,
            "installed snapshot {} at or below commit index {}",
            snapshot.last_index,
            self.commit_index
        );
        let position = (snapshot.last_index, snapshot.last_term);
        self.store.set_metadata(&Key::Snapshot.encode(), snapshot.encode()?)?;
        if self.has(snapshot.last_index, snapshot.last_term)? {
            // Our log contains the snapshot position; keep the suffix beyond
            // it and compact the covered prefix.
            self.store.commit(snapshot.last_index)?;
            self.store.compact(snapshot.last_index)?;
        } else {
            // The log conflicts with or falls short of the snapshot. Discard
            // it entirely and continue from the snapshot position.
            self.store.reset(snapshot.last_index)?;
            self.last_index = snapshot.last_index;
            self.last_term = snapshot.last_term;
        }
        self.store.flush()?;
        self.snapshot = Some(position);
        self.commit_index = snapshot.last_index;
        self.commit_term = snapshot.last_term;
        Ok(position)
    }

}

/// Iterator over a log entry range.
pub type Scan<'a> = Box<dyn Iterator<Item = Result<Entry>> + 'a>;
