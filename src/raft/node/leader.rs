use super::super::{APPEND_BATCH_SIZE, HEARTBEAT_INTERVAL, INSTALL_CHUNK_SIZE, QUORUM_TIMEOUT};
use super::*;
use crate::protocol::{
    CommandRequest, CommandResponse, Consistency, KeepAliveResponse, QueryRequest,
    RegisterResponse, Request,
};
use crate::raft::SessionAck;

use log::{debug, info};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// A leader serves client sessions and replicates the log to the cluster.
#[derive(Debug, Default)]
pub struct Leader {
    /// Replication progress per replica (active and passive members).
    progress: HashMap<NodeID, Progress>,
    /// Ticks since the last heartbeat round.
    since_heartbeat: Ticks,
    /// Active peers heard from since the last acknowledged quorum round.
    quorum_seen: HashSet<NodeID>,
    /// Ticks since a quorum of active members was last heard from. A leader
    /// that can't reach a quorum steps down, since another leader may have
    /// been elected behind a partition.
    since_quorum: Ticks,
    /// The current read sequence number for linearizable queries.
    read_seq: u64,
    /// Linearizable queries awaiting a quorum round confirming leadership.
    reads: VecDeque<PendingRead>,
    /// Queries confirmed (or sequential) awaiting the applied index.
    ready_queries: Vec<PendingQuery>,
    /// Pending command responses by (session, sequence).
    commands: HashMap<(SessionId, u64), RequestId>,
    /// Pending register responses by register entry index.
    registers: HashMap<Index, RequestId>,
    /// Pending unregister responses by session.
    unregisters: HashMap<SessionId, RequestId>,
    /// Pending reconfigure responses by configuration entry index.
    reconfigures: HashMap<Index, RequestId>,
    /// Commands that arrived ahead of their session's sequence order,
    /// appended once the gap closes.
    buffered: HashMap<SessionId, BTreeMap<u64, CommandRequest>>,
    /// The next expected sequence per session (highest appended plus one).
    next_sequence: HashMap<SessionId, u64>,
    /// Keep-alive acknowledgements buffered for the next batched entry.
    keepalive_buffer: Vec<(RequestId, SessionAck)>,
    /// Request ids awaiting a keep-alive entry, by entry index.
    keepalives: HashMap<Index, Vec<RequestId>>,
    /// Sessions with an expiry unregister already in flight.
    proposed_expiries: HashSet<SessionId>,
    /// The index of this term's initialize entry. Session operations are
    /// refused until it is applied: before that, the session state still
    /// lags entries committed in earlier terms.
    floor: Index,
}

/// Per-replica replication progress.
#[derive(Debug)]
struct Progress {
    /// The next log index to replicate.
    next: Index,
    /// The last log index known to be stored on the replica.
    last: Index,
    /// The highest read sequence number the replica has echoed.
    read_seq: u64,
    /// An in-flight snapshot transfer, if the replica's position has been
    /// compacted away.
    install: Option<InstallProgress>,
}

#[derive(Debug)]
struct InstallProgress {
    id: u64,
    offset: u64,
}

/// A linearizable query batch awaiting leadership confirmation.
#[derive(Debug)]
struct PendingRead {
    read_seq: u64,
    queries: Vec<PendingQuery>,
}

/// A query awaiting execution against sufficiently fresh applied state.
#[derive(Debug)]
struct PendingQuery {
    id: RequestId,
    session: SessionId,
    sequence: u64,
    /// The query executes once at least this much state is applied.
    index: Index,
    query: Vec<u8>,
}

impl Role for Leader {}

impl Leader {
    /// Creates a new leader role. assume() initializes it.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RawNode<Leader> {
    /// Assumes leadership: initializes replication progress, appends an
    /// initialize entry establishing the commit floor for the term, and
    /// announces itself with a heartbeat round.
    pub(crate) fn assume(&mut self) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        for id in self.replicas() {
            self.role.progress.insert(
                id,
                Progress { next: last_index + 1, last: 0, read_seq: 0, install: None },
            );
        }
        self.role.floor = self.log.append(EntryKind::Initialize { timestamp: self.clock })?;
        self.heartbeat()?;
        self.send_configuration()?;
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Sends an append to every replica.
    fn heartbeat(&mut self) -> Result<()> {
        for id in self.replicas() {
            self.send_append(id)?;
        }
        Ok(())
    }

    /// Pushes the current configuration to reserve members, which receive
    /// neither log replication nor elections.
    fn send_configuration(&mut self) -> Result<()> {
        let reserves = self.reserves();
        if reserves.is_empty() {
            return Ok(());
        }
        let message =
            Message::Configure { index: self.config_index, members: self.members.clone() };
        self.send_to_all(&reserves, message)
    }

    /// Returns the highest log index stored on every replica (and ourselves),
    /// bounding safe cluster-wide compaction.
    fn global_index(&self) -> Index {
        self.role
            .progress
            .values()
            .map(|p| p.last)
            .chain(std::iter::once(self.log.get_last_index().0))
            .min()
            .unwrap_or(0)
    }

    /// Replicates the log to a replica: entries from its next index, bounded
    /// by the batch size, or a snapshot transfer if its position has been
    /// compacted away. An empty append doubles as a heartbeat.
    fn send_append(&mut self, to: NodeID) -> Result<()> {
        let Some(progress) = self.role.progress.get(&to) else {
            return Err(Error::Internal(format!("no progress for replica {to}")));
        };
        if progress.install.is_some() {
            // The chunk flow drives snapshot transfers.
            return Ok(());
        }
        if progress.next < self.log.first_index() {
            return self.start_install(to);
        }
        let base_index = progress.next - 1;
        let next = progress.next;
        let base_term = self
            .log
            .term_at(base_index)?
            .ok_or_else(|| Error::Internal(format!("missing base entry {base_index}")))?;
        let entries = self
            .log
            .scan(next..next + APPEND_BATCH_SIZE)
            .collect::<Result<Vec<_>>>()?;
        debug!("Replicating {} entries at base {base_index} to {to}", entries.len());
        self.send(
            Address::Node(to),
            Message::Append {
                base_index,
                base_term,
                commit_index: self.log.get_commit_index().0,
                global_index: self.global_index(),
                read_seq: self.role.read_seq,
                entries,
            },
        )
    }

    /// Begins a snapshot transfer to a replica whose next index has been
    /// compacted away.
    fn start_install(&mut self, to: NodeID) -> Result<()> {
        let snapshot = self
            .log
            .snapshot()?
            .ok_or_else(|| Error::Internal("compacted log without snapshot".into()))?;
        info!("Sending snapshot through index {} to {to}", snapshot.last_index);
        let progress = self.role.progress.get_mut(&to).expect("progress exists");
        progress.install = Some(InstallProgress { id: snapshot.last_index, offset: 0 });
        self.send_install_chunk(to)
    }

    /// Sends the next snapshot chunk to a replica.
    fn send_install_chunk(&mut self, to: NodeID) -> Result<()> {
        let snapshot = self
            .log
            .snapshot()?
            .ok_or_else(|| Error::Internal("snapshot vanished mid-transfer".into()))?;
        let Some(progress) = self.role.progress.get(&to) else {
            return Ok(());
        };
        let Some(install) = &progress.install else {
            return Ok(());
        };
        let offset = install.offset as usize;
        let end = (offset + INSTALL_CHUNK_SIZE).min(snapshot.data.len());
        let data = snapshot.data[offset..end].to_vec();
        self.send(
            Address::Node(to),
            Message::Install {
                id: snapshot.last_index,
                index: snapshot.last_index,
                last_term: snapshot.last_term,
                offset: offset as u64,
                data,
                complete: end >= snapshot.data.len(),
            },
        )
    }

    /// Commits entries replicated to a quorum of active members, and applies
    /// them. The commit index only advances to an entry of the current term;
    /// earlier-term entries commit transitively (Raft figure 8).
    fn maybe_commit_and_apply(&mut self) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let last_indexes: Vec<Index> = self
            .members
            .iter()
            .filter(|m| m.member_type == MemberType::Active)
            .map(|m| match m.id == self.id {
                true => last_index,
                false => self.role.progress.get(&m.id).map(|p| p.last).unwrap_or(0),
            })
            .collect();
        let quorum_index = self.quorum_value(last_indexes);

        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index > commit_index
            && self.log.term_at(quorum_index)? == Some(self.term)
        {
            self.log.commit(quorum_index)?;
        }

        let config_before = self.config_index;
        let applied = self.maybe_apply()?;
        self.handle_applied(applied)?;
        if self.config_index != config_before {
            self.reconcile_progress();
            self.send_configuration()?;
            if let Some(id) = self.role.reconfigures.remove(&self.config_index) {
                self.respond(id, Ok(Response::Reconfigure(self.config_index)))?;
            }
        }
        self.drain_queries()?;
        Ok(())
    }

    /// Responds to clients for entry outcomes, and proposes unregisters for
    /// sessions the keep-alive clock has expired.
    fn handle_applied(&mut self, applied: Vec<Applied>) -> Result<()> {
        for outcome in applied {
            match outcome {
                Applied::Command { session, sequence, index, event_index, last_sequence, result } => {
                    if let Some(id) = self.role.commands.remove(&(session, sequence)) {
                        self.respond_command(
                            id,
                            CommandResponse { index, event_index, last_sequence, result },
                        )?;
                    }
                }
                Applied::Register { session, timeout } => {
                    if let Some(id) = self.role.registers.remove(&session) {
                        let response = RegisterResponse {
                            session,
                            timeout,
                            leader: self.client_address_of(self.id),
                            members: self.members.clone(),
                        };
                        self.respond(id, Ok(Response::Register(response)))?;
                    }
                }
                Applied::KeepAlive { index, expired } => {
                    for id in self.role.keepalives.remove(&index).unwrap_or_default() {
                        let response = KeepAliveResponse {
                            leader: self.client_address_of(self.id),
                            members: self.members.clone(),
                        };
                        self.respond(id, Ok(Response::KeepAlive(response)))?;
                    }
                    for session in expired {
                        self.propose_expiry(session)?;
                    }
                }
                Applied::Unregister { session, expired: _ } => {
                    self.role.next_sequence.remove(&session);
                    self.role.buffered.remove(&session);
                    self.role.proposed_expiries.remove(&session);
                    if let Some(id) = self.role.unregisters.remove(&session) {
                        self.respond(id, Ok(Response::Unregister))?;
                    }
                }
                // Publishes are routed during apply.
                Applied::Publish(_) => {}
            }
        }
        Ok(())
    }

    /// Responds to a command request. Application errors ride inside the
    /// command response, since the command still consumed its sequence
    /// number; everything else is a response-level error.
    fn respond_command(&self, id: RequestId, response: CommandResponse) -> Result<()> {
        match &response.result {
            Ok(_) | Err(Error::Application(_)) => {
                self.respond(id, Ok(Response::Command(response)))
            }
            Err(err) => self.respond(id, Err(err.clone())),
        }
    }

    /// Appends an unregister entry expiring an overdue session, at most once
    /// per session.
    fn propose_expiry(&mut self, session: SessionId) -> Result<()> {
        if !self.role.proposed_expiries.insert(session) {
            return Ok(());
        }
        if self.driver.sessions().get(session).is_none() {
            return Ok(());
        }
        info!("Expiring session {session}");
        self.log.append(EntryKind::Unregister {
            session,
            expired: true,
            timestamp: self.clock,
        })?;
        self.heartbeat()
    }

    /// Appends a command entry (or a no-op fill) and registers its pending
    /// response.
    fn append_command(&mut self, id: Option<RequestId>, request: CommandRequest) -> Result<()> {
        let CommandRequest { session, sequence, command } = request;
        let kind = match command {
            Some(command) => {
                EntryKind::Command { session, sequence, timestamp: self.clock, command }
            }
            None => EntryKind::NoOp { session, sequence, timestamp: self.clock },
        };
        self.log.append(kind)?;
        self.role.next_sequence.insert(session, sequence + 1);
        if let Some(id) = id {
            self.role.commands.insert((session, sequence), id);
        }
        Ok(())
    }

    /// Handles a client command: appends it in sequence order, answers
    /// retries from the session's result cache, buffers commands ahead of
    /// order (telling the client to resubmit the gap), and drains buffered
    /// successors once the gap closes.
    fn step_command(&mut self, id: RequestId, request: CommandRequest) -> Result<()> {
        let CommandRequest { session, sequence, .. } = request;
        let Some(state) = self.driver.sessions().get(session) else {
            return self.respond(id, Err(Error::UnknownSession));
        };
        let applied_sequence = state.command_sequence;
        let next = self
            .role
            .next_sequence
            .get(&session)
            .copied()
            .unwrap_or(applied_sequence + 1);

        if sequence <= applied_sequence {
            // A retry of an applied command: answer from the result cache.
            let state = self.driver.sessions().get(session).expect("checked above");
            let response = CommandResponse {
                index: state.last_applied,
                event_index: state.event_index,
                last_sequence: state.command_sequence,
                result: state.cached_result(sequence).cloned().unwrap_or(Err(Error::Abort)),
            };
            return self.respond_command(id, response);
        }
        if sequence < next {
            // Already appended but not yet applied: respond when it is.
            self.role.commands.insert((session, sequence), id);
            return Ok(());
        }
        if sequence > next {
            // A sequence gap: hold the command and tell the client to
            // resubmit everything after our last appended sequence.
            debug!("Command gap for session {session}: got {sequence}, expected {next}");
            self.role.buffered.entry(session).or_default().insert(sequence, request);
            return self.respond(id, Err(Error::CommandGap { last_sequence: next - 1 }));
        }

        self.append_command(Some(id), request)?;
        // Drain any buffered successors the append unblocked. Their original
        // requests were already answered with a gap error; responses flow to
        // the client's resubmissions instead.
        loop {
            let next = self.role.next_sequence[&session];
            let Some(buffered) =
                self.role.buffered.get_mut(&session).and_then(|b| b.remove(&next))
            else {
                break;
            };
            self.append_command(None, buffered)?;
        }
        self.heartbeat()?;
        self.maybe_commit_and_apply()
    }

    /// Handles a client query, gating it on applied state freshness and, for
    /// linearizable queries, on a quorum round confirming leadership.
    fn step_query(&mut self, id: RequestId, request: QueryRequest) -> Result<()> {
        let QueryRequest { session, sequence, index, query, consistency } = request;
        if self.driver.sessions().get(session).is_none() {
            return self.respond(id, Err(Error::UnknownSession));
        }
        let pending = PendingQuery { id, session, sequence, index, query };
        match consistency {
            Consistency::Sequential => {
                self.role.ready_queries.push(pending);
                self.drain_queries()
            }
            Consistency::Linearizable => {
                self.role.read_seq += 1;
                let read_seq = self.role.read_seq;
                self.role.reads.push_back(PendingRead { read_seq, queries: vec![pending] });
                // Confirm leadership immediately rather than waiting a tick.
                self.heartbeat()?;
                self.check_read_confirmations()
            }
        }
    }

    /// Completes linearizable reads whose sequence number a quorum of active
    /// members has echoed.
    fn check_read_confirmations(&mut self) -> Result<()> {
        let read_seqs: Vec<u64> = self
            .members
            .iter()
            .filter(|m| m.member_type == MemberType::Active)
            .map(|m| match m.id == self.id {
                true => self.role.read_seq,
                false => self.role.progress.get(&m.id).map(|p| p.read_seq).unwrap_or(0),
            })
            .collect();
        let confirmed = self.quorum_value(read_seqs);
        while self.role.reads.front().map(|r| r.read_seq <= confirmed).unwrap_or(false) {
            let read = self.role.reads.pop_front().expect("checked nonempty");
            self.role.ready_queries.extend(read.queries);
        }
        self.drain_queries()
    }

    /// Executes ready queries whose required index has been applied.
    fn drain_queries(&mut self) -> Result<()> {
        let applied = self.driver.applied_index();
        let ready: Vec<PendingQuery> = {
            let queries = &mut self.role.ready_queries;
            let mut ready = Vec::new();
            let mut keep = Vec::new();
            for query in queries.drain(..) {
                if query.index <= applied {
                    ready.push(query);
                } else {
                    keep.push(query);
                }
            }
            *queries = keep;
            ready
        };
        for query in ready {
            let response = self
                .driver
                .query(query.session, query.sequence, &query.query)
                .map(Response::Query);
            self.respond(query.id, response)?;
        }
        Ok(())
    }

    /// Updates replication progress after a configuration change: new
    /// replicas start from the end of the log, removed ones are dropped.
    fn reconcile_progress(&mut self) {
        let (last_index, _) = self.log.get_last_index();
        let replicas = self.replicas();
        for id in &replicas {
            self.role.progress.entry(*id).or_insert(Progress {
                next: last_index + 1,
                last: 0,
                read_seq: 0,
                install: None,
            });
        }
        self.role.progress.retain(|id, _| replicas.contains(id));
    }

    /// Transforms the leader into a follower, e.g. after discovering a higher
    /// term or losing contact with a quorum.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        // Fail all pending client work; clients retry against the new leader.
        self.abort_requests()?;
        if term > self.term {
            self.log.set_term(term, None)?;
            self.term = term;
            return Ok(self.into_role(Follower::new(leader, None)));
        }
        let id = self.id;
        Ok(self.into_role(Follower::new(leader, Some(id))))
    }

    /// Aborts all pending client requests with Error::Abort, so clients
    /// retry them against the next leader.
    fn abort_requests(&mut self) -> Result<()> {
        let ids: Vec<RequestId> = self
            .role
            .commands
            .drain()
            .map(|(_, id)| id)
            .chain(self.role.registers.drain().map(|(_, id)| id))
            .chain(self.role.unregisters.drain().map(|(_, id)| id))
            .chain(self.role.reconfigures.drain().map(|(_, id)| id))
            .chain(self.role.keepalives.drain().flat_map(|(_, ids)| ids))
            .chain(self.role.keepalive_buffer.drain(..).map(|(id, _)| id))
            .chain(self.role.reads.drain(..).flat_map(|r| r.queries).map(|q| q.id))
            .chain(self.role.ready_queries.drain(..).map(|q| q.id))
            .collect();
        for id in ids {
            self.respond(id, Err(Error::Abort))?;
        }
        Ok(())
    }

    /// Processes a message.
    pub fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if let Address::Node(_) = msg.from {
            if msg.term > self.term {
                info!("Discovered new term {}, stepping down", msg.term);
                return self.into_follower(msg.term, None)?.step(msg);
            }
            if msg.term < self.term {
                match msg.message {
                    Message::Poll { .. } => {
                        self.send(msg.from, Message::PollResponse { accepted: false })?
                    }
                    Message::Vote { .. } => {
                        self.send(msg.from, Message::VoteResponse { granted: false })?
                    }
                    _ => {}
                }
                return Ok(self.into());
            }
            if matches!(msg.message, Message::Append { .. }) {
                panic!("multiple leaders in term {}", self.term);
            }
        }

        match msg.message {
            Message::AppendResponse { succeeded, last_index, read_seq } => {
                let from = msg.from.unwrap_node();
                if self.type_of(from) == MemberType::Active {
                    self.role.quorum_seen.insert(from);
                    if self.role.quorum_seen.len() as u64 + 1 >= self.quorum_size() {
                        self.role.quorum_seen.clear();
                        self.role.since_quorum = 0;
                    }
                }
                let Some(progress) = self.role.progress.get_mut(&from) else {
                    return Ok(self.into());
                };
                progress.read_seq = progress.read_seq.max(read_seq);
                if succeeded {
                    progress.last = progress.last.max(last_index);
                    progress.next = progress.last + 1;
                    self.maybe_commit_and_apply()?;
                    self.check_read_confirmations()?;
                    let progress = self.role.progress.get(&from).expect("progress exists");
                    if progress.install.is_none() && progress.next <= self.log.get_last_index().0
                    {
                        self.send_append(from)?;
                    }
                } else {
                    // Probe backwards, using the replica's reported last
                    // index as a hint, without underflowing the compaction
                    // point (which switches to a snapshot transfer).
                    progress.next =
                        progress.next.saturating_sub(1).min(last_index + 1).max(1);
                    self.check_read_confirmations()?;
                    self.send_append(from)?;
                }
            }

            Message::InstallResponse { succeeded, offset } => {
                let from = msg.from.unwrap_node();
                let snapshot_len = self.log.snapshot()?.map(|s| s.data.len() as u64);
                let Some(progress) = self.role.progress.get_mut(&from) else {
                    return Ok(self.into());
                };
                let Some(install) = progress.install.as_mut() else {
                    return Ok(self.into());
                };
                if !succeeded {
                    // Resume from the replica's assembled offset.
                    install.offset = offset;
                    self.send_install_chunk(from)?;
                } else if Some(offset) >= snapshot_len {
                    // Transfer complete: resume replication past the
                    // snapshot.
                    let id = install.id;
                    progress.install = None;
                    progress.last = progress.last.max(id);
                    progress.next = progress.last + 1;
                    self.send_append(from)?;
                } else {
                    install.offset = offset;
                    self.send_install_chunk(from)?;
                }
            }

            // Our term is current; polls and votes are refused.
            Message::Poll { .. } => {
                self.send(msg.from, Message::PollResponse { accepted: false })?
            }
            Message::Vote { .. } => {
                self.send(msg.from, Message::VoteResponse { granted: false })?
            }

            Message::ClientRequest { id, request } => {
                // Connects are handled here rather than in the common step,
                // since the leader also records the session binding in the
                // log.
                if matches!(request, Request::Connect(_)) {
                    self.step_leader_request(id, request)?;
                } else if let Some((id, request)) =
                    self.step_common_request(id, request, Some(self.id))?
                {
                    self.step_leader_request(id, request)?;
                }
            }

            Message::PollResponse { .. }
            | Message::VoteResponse { .. }
            | Message::ConfigureResponse { .. } => {}

            Message::Install { .. } | Message::Configure { .. } => {
                panic!("competing leader in term {}", self.term)
            }
            Message::Append { .. } => unreachable!("handled above"),
            Message::ClientResponse { .. } | Message::Publish(_) => {
                panic!("received outbound message {:?}", msg.message)
            }
        }

        self.reconcile_membership()
    }

    /// Handles the client requests only a leader serves.
    fn step_leader_request(&mut self, id: RequestId, request: Request) -> Result<()> {
        // Until this term's initialize entry is applied, the session state
        // may lag entries committed in earlier terms; abort session work so
        // clients retry once the backlog is applied.
        if self.driver.applied_index() < self.role.floor && !matches!(request, Request::Connect(_))
        {
            return self.respond(id, Err(Error::Abort));
        }
        match request {
            Request::Command(command) => self.step_command(id, command),
            Request::Query(query) => self.step_query(id, query),
            Request::Register(register) => {
                let index = self.log.append(EntryKind::Register {
                    client: register.client,
                    timeout: register.timeout,
                    timestamp: self.clock,
                })?;
                self.role.registers.insert(index, id);
                self.heartbeat()?;
                self.maybe_commit_and_apply()
            }
            Request::KeepAlive(keep_alive) => {
                if self.driver.sessions().get(keep_alive.session).is_none() {
                    return self.respond(id, Err(Error::UnknownSession));
                }
                self.role.keepalive_buffer.push((
                    id,
                    SessionAck {
                        session: keep_alive.session,
                        command_sequence: keep_alive.command_sequence,
                        event_index: keep_alive.event_index,
                    },
                ));
                Ok(())
            }
            Request::Unregister(unregister) => {
                if self.driver.sessions().get(unregister.session).is_none() {
                    return self.respond(id, Err(Error::UnknownSession));
                }
                self.log.append(EntryKind::Unregister {
                    session: unregister.session,
                    expired: false,
                    timestamp: self.clock,
                })?;
                self.role.unregisters.insert(unregister.session, id);
                self.heartbeat()?;
                self.maybe_commit_and_apply()
            }
            Request::Reconfigure(members) => {
                let index =
                    self.log.append(EntryKind::Configuration { members })?;
                self.role.reconfigures.insert(index, id);
                self.heartbeat()?;
                self.maybe_commit_and_apply()
            }
            Request::Connect(connect) => {
                // Common handling answers connects; this only arises for a
                // session binding, recorded through the log.
                if connect.session > 0 && self.driver.sessions().get(connect.session).is_some() {
                    self.log.append(EntryKind::Connect {
                        session: connect.session,
                        node: self.id,
                    })?;
                    self.heartbeat()?;
                    self.maybe_commit_and_apply()?;
                }
                let response = self.connect_response(Some(self.id));
                self.respond(id, Ok(response))
            }
            Request::Reset(_) | Request::Status => unreachable!("handled by common step"),
        }
    }

    /// Processes a logical clock tick.
    pub fn tick(mut self) -> Result<Node> {
        self = self.advance_clock();

        // Step down if an election timeout passes without a quorum of active
        // members responding.
        if self.quorum_size() > 1 {
            self.role.since_quorum += 1;
            if self.role.since_quorum >= QUORUM_TIMEOUT {
                info!("Lost contact with cluster quorum, stepping down");
                let term = self.term;
                return Ok(self.into_follower(term, None)?.into());
            }
        }

        // Flush buffered keep-alives as a single batched entry.
        if !self.role.keepalive_buffer.is_empty() {
            let (ids, acks): (Vec<RequestId>, Vec<SessionAck>) =
                self.role.keepalive_buffer.drain(..).unzip();
            let index = self
                .log
                .append(EntryKind::KeepAlive { acks, timestamp: self.clock })?;
            self.role.keepalives.insert(index, ids);
            self.heartbeat()?;
            self.maybe_commit_and_apply()?;
        }

        // Propose expiry for sessions that have gone quiet.
        let suspects = self.driver.suspects(self.clock);
        for session in suspects {
            self.propose_expiry(session)?;
        }

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= HEARTBEAT_INTERVAL {
            self.role.since_heartbeat = 0;
            self.heartbeat()?;
        }

        // Advance commits locally too, for single-node clusters.
        self.maybe_commit_and_apply()?;

        let bound = self.global_index();
        self.maybe_compact(bound)?;
        self.reconcile_membership()
    }

    /// Reconciles the node's role against the current configuration.
    fn reconcile_membership(self) -> Result<Node> {
        match self.my_type() {
            MemberType::Active => Ok(self.into()),
            MemberType::Passive => {
                info!("Demoted to passive member, stepping down");
                let mut node = self;
                node.abort_requests()?;
                Ok(node.into_role(Passive::new()).into())
            }
            MemberType::Reserve => {
                info!("Demoted to reserve member, stepping down");
                let mut node = self;
                node.abort_requests()?;
                Ok(node.into_role(Reserve::new()).into())
            }
            MemberType::Inactive => {
                info!("Removed from cluster, becoming inactive");
                let mut node = self;
                node.abort_requests()?;
                Ok(node.into_role(Inactive).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{active_members, assert_messages, assert_node, drain, TestState};
    use super::*;
    use crate::protocol::{
        ConnectRequest, Consistency, KeepAliveRequest, QueryResponse, RegisterRequest,
        UnregisterRequest,
    };
    use crate::raft::{EntryKind, Log, Snapshot};
    use crate::session::Driver;
    use crate::storage;

    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;

    /// Builds a leader on node 1 of a 3-node cluster at term 2, with a
    /// registered session (id 1) and the initialize entry (index 2) fully
    /// replicated, committed, and applied.
    fn setup() -> (RawNode<Leader>, Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let mut log = Log::new(Box::new(storage::log::Memory::new())).unwrap();
        log.set_term(1, None).unwrap();
        log.append(EntryKind::Register { client: "c1".into(), timeout: 5000, timestamp: 900 })
            .unwrap();
        log.commit(1).unwrap();
        log.set_term(2, Some(1)).unwrap();

        let mut driver = Driver::new(Box::new(TestState::new()));
        driver.apply(log.get(1).unwrap().unwrap()).unwrap();

        let mut node = RawNode {
            id: 1,
            members: active_members(&[1, 2, 3]),
            term: 2,
            log,
            driver,
            node_tx,
            clock: 1000,
            config_index: 0,
            role: Leader::new(),
        };
        node.assume().unwrap();

        let mut node = Node::Leader(node);
        for peer in [2, 3] {
            node = node
                .step(msg(
                    peer,
                    Message::AppendResponse { succeeded: true, last_index: 2, read_seq: 0 },
                ))
                .unwrap();
        }
        drain(&node_rx);
        assert_node(&node).is_leader().term(2).last(2).committed(2).applied(2);
        match node {
            Node::Leader(leader) => (leader, node_rx),
            _ => unreachable!(),
        }
    }

    fn msg(from: NodeID, message: Message) -> Envelope {
        Envelope { from: Address::Node(from), to: Address::Node(1), term: 2, message }
    }

    fn request(id: u8, request: Request) -> Envelope {
        Envelope {
            from: Address::Client,
            to: Address::Node(1),
            term: 0,
            message: Message::ClientRequest { id: vec![id], request },
        }
    }

    fn command_request(id: u8, sequence: u64, command: Vec<u8>) -> Envelope {
        request(id, Request::Command(CommandRequest { session: 1, sequence, command: Some(command) }))
    }

    /// Extracts client responses from the outbound messages.
    fn client_responses(envelopes: Vec<Envelope>) -> Vec<(RequestId, Result<Response>)> {
        envelopes
            .into_iter()
            .filter_map(|e| match e.message {
                Message::ClientResponse { id, response } => Some((id, response)),
                _ => None,
            })
            .collect()
    }

    #[test]
    // Assuming leadership appends an initialize entry and replicates it.
    fn assume_appends_initialize() {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let mut log = Log::new(Box::new(storage::log::Memory::new())).unwrap();
        log.set_term(2, Some(1)).unwrap();
        let mut node = RawNode {
            id: 1,
            members: active_members(&[1, 2, 3]),
            term: 2,
            log,
            driver: Driver::new(Box::new(TestState::new())),
            node_tx,
            clock: 1000,
            config_index: 0,
            role: Leader::new(),
        };
        node.assume().unwrap();

        assert_eq!(
            Some(Entry { index: 1, term: 2, kind: EntryKind::Initialize { timestamp: 1000 } }),
            node.log.get(1).unwrap()
        );
        let appends = drain(&node_rx);
        assert_eq!(2, appends.len());
        for envelope in appends {
            match envelope.message {
                Message::Append { base_index: 0, base_term: 0, ref entries, .. } => {
                    assert_eq!(1, entries.len())
                }
                message => panic!("unexpected message {message:?}"),
            }
        }
    }

    #[test]
    // A command is appended, replicated, and answered once a quorum has
    // stored it.
    fn command_round_trip() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        node = node.step(command_request(0xa1, 1, vec![0xaf])).unwrap();
        assert_node(&node).is_leader().last(3).committed(2);
        let appends = drain(&rx);
        assert_eq!(2, appends.len(), "expected appends to both peers");

        // The first peer ack reaches a quorum (2 of 3): the entry commits,
        // applies, and the response goes out.
        node = node
            .step(msg(2, Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 0 }))
            .unwrap();
        assert_node(&node).is_leader().committed(3).applied(3);
        assert_eq!(
            vec![(
                vec![0xa1],
                Ok(Response::Command(CommandResponse {
                    index: 3,
                    event_index: 0,
                    last_sequence: 1,
                    result: Ok(vec![0xff, 0xaf]),
                }))
            )],
            client_responses(drain(&rx))
        );
    }

    #[test]
    // A retried command with an applied sequence number is answered from the
    // result cache without re-applying.
    fn command_retry_cached() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        node = node.step(command_request(0xa1, 1, vec![0xaf])).unwrap();
        node = node
            .step(msg(2, Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 0 }))
            .unwrap();
        drain(&rx);

        node = node.step(command_request(0xa2, 1, vec![0xaf])).unwrap();
        assert_node(&node).is_leader().last(3);
        assert_eq!(
            vec![(
                vec![0xa2],
                Ok(Response::Command(CommandResponse {
                    index: 3,
                    event_index: 0,
                    last_sequence: 1,
                    result: Ok(vec![0xff, 0xaf]),
                }))
            )],
            client_responses(drain(&rx))
        );
    }

    #[test]
    // A command ahead of its session's sequence order is buffered and
    // refused with the last appended sequence, so the client can resubmit
    // the gap. Once the gap closes, the buffered command applies too.
    fn command_gap_buffers_and_resubmits() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        // Sequence 1 is appended normally.
        node = node.step(command_request(0xa1, 1, vec![0x01])).unwrap();
        drain(&rx);

        // Sequence 3 is ahead: buffered, and refused with last_sequence 1.
        node = node.step(command_request(0xa3, 3, vec![0x03])).unwrap();
        assert_node(&node).is_leader().last(3);
        assert_eq!(
            vec![(vec![0xa3], Err(Error::CommandGap { last_sequence: 1 }))],
            client_responses(drain(&rx))
        );

        // Sequence 2 closes the gap: both 2 and the buffered 3 are appended.
        node = node.step(command_request(0xa2, 2, vec![0x02])).unwrap();
        assert_node(&node).is_leader().last(5);
        drain(&rx);

        // The client also resubmits 3; it is already appended, so the
        // request is registered for a response instead of re-appending.
        node = node.step(command_request(0xa4, 3, vec![0x03])).unwrap();
        assert_node(&node).is_leader().last(5);
        drain(&rx);

        // Once a quorum stores everything, responses fire in order 1, 2, 3.
        node = node
            .step(msg(2, Message::AppendResponse { succeeded: true, last_index: 5, read_seq: 0 }))
            .unwrap();
        assert_node(&node).committed(5).applied(5);
        let responses = client_responses(drain(&rx));
        assert_eq!(3, responses.len());
        assert_eq!(vec![0xa1], responses[0].0);
        assert_eq!(vec![0xa2], responses[1].0);
        assert_eq!(vec![0xa4], responses[2].0);
        for (i, (_, response)) in responses.iter().enumerate() {
            match response {
                Ok(Response::Command(cr)) => {
                    assert_eq!(i as u64 + 1, cr.last_sequence);
                    assert_eq!(Ok(vec![0xff, i as u8 + 1]), cr.result);
                }
                response => panic!("unexpected response {response:?}"),
            }
        }
    }

    #[test]
    // Commands for unknown sessions are refused immediately.
    fn command_unknown_session() {
        let (leader, rx) = setup();
        let node = Node::Leader(leader);
        node.step(request(
            0xa1,
            Request::Command(CommandRequest { session: 9, sequence: 1, command: Some(vec![]) }),
        ))
        .unwrap();
        assert_eq!(
            vec![(vec![0xa1], Err(Error::UnknownSession))],
            client_responses(drain(&rx))
        );
    }

    #[test]
    // A linearizable query answers only after a quorum echoes the read
    // sequence number, confirming leadership.
    fn linearizable_query() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        node = node
            .step(request(
                0xb1,
                Request::Query(QueryRequest {
                    session: 1,
                    sequence: 0,
                    index: 0,
                    query: vec![0x01],
                    consistency: Consistency::Linearizable,
                }),
            ))
            .unwrap();
        // Heartbeats carry the new read sequence; no response yet.
        let heartbeats = drain(&rx);
        assert_eq!(2, heartbeats.len());
        for envelope in &heartbeats {
            assert!(
                matches!(envelope.message, Message::Append { read_seq: 1, .. }),
                "unexpected {envelope:?}"
            );
        }

        node = node
            .step(msg(3, Message::AppendResponse { succeeded: true, last_index: 2, read_seq: 1 }))
            .unwrap();
        assert_node(&node).is_leader();
        assert_eq!(
            vec![(
                vec![0xb1],
                Ok(Response::Query(QueryResponse {
                    index: 2,
                    event_index: 0,
                    result: vec![0xbb, 0x00],
                }))
            )],
            client_responses(drain(&rx))
        );
    }

    #[test]
    // A sequential query skips the confirmation round.
    fn sequential_query() {
        let (leader, rx) = setup();
        let node = Node::Leader(leader);
        node.step(request(
            0xb1,
            Request::Query(QueryRequest {
                session: 1,
                sequence: 0,
                index: 0,
                query: vec![0x01],
                consistency: Consistency::Sequential,
            }),
        ))
        .unwrap();
        assert_eq!(
            vec![(
                vec![0xb1],
                Ok(Response::Query(QueryResponse {
                    index: 2,
                    event_index: 0,
                    result: vec![0xbb, 0x00],
                }))
            )],
            client_responses(drain(&rx))
        );
    }

    #[test]
    // Queries ahead of the session's applied commands are refused.
    fn query_gap() {
        let (leader, rx) = setup();
        let node = Node::Leader(leader);
        node.step(request(
            0xb1,
            Request::Query(QueryRequest {
                session: 1,
                sequence: 5,
                index: 0,
                query: vec![0x01],
                consistency: Consistency::Sequential,
            }),
        ))
        .unwrap();
        assert_eq!(vec![(vec![0xb1], Err(Error::QueryGap))], client_responses(drain(&rx)));
    }

    #[test]
    // Keep-alives are batched into a single entry per tick, and answered
    // once it applies.
    fn keepalive_batched() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        node = node
            .step(request(
                0xc1,
                Request::KeepAlive(KeepAliveRequest {
                    session: 1,
                    command_sequence: 0,
                    event_index: 0,
                }),
            ))
            .unwrap();
        assert_messages(&rx, vec![]);

        // The tick flushes the batch as one keep-alive entry.
        node = node.tick().unwrap();
        assert_node(&node).is_leader().last(3);
        drain(&rx);

        node = node
            .step(msg(2, Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 0 }))
            .unwrap();
        let responses = client_responses(drain(&rx));
        assert_eq!(1, responses.len());
        assert_eq!(vec![0xc1], responses[0].0);
        assert!(matches!(responses[0].1, Ok(Response::KeepAlive(_))));
    }

    #[test]
    // An explicit unregister closes the session.
    fn unregister() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        node = node
            .step(request(0xd1, Request::Unregister(UnregisterRequest { session: 1 })))
            .unwrap();
        drain(&rx);
        node = node
            .step(msg(2, Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 0 }))
            .unwrap();
        assert_node(&node).applied(3);
        assert_eq!(
            vec![(vec![0xd1], Ok(Response::Unregister))],
            client_responses(drain(&rx))
        );
    }

    #[test]
    // On a single-node cluster, a quiet session is expired by an unregister
    // entry once twice its timeout passes.
    fn session_expiry_single_node() {
        let (node_tx, rx) = crossbeam::channel::unbounded();
        let mut log = Log::new(Box::new(storage::log::Memory::new())).unwrap();
        log.set_term(1, Some(1)).unwrap();
        let mut raw = RawNode {
            id: 1,
            members: active_members(&[1]),
            term: 1,
            log,
            driver: Driver::new(Box::new(TestState::new())),
            node_tx,
            clock: 1000,
            config_index: 0,
            role: Leader::new(),
        };
        raw.assume().unwrap();
        let mut node = Node::Leader(raw);

        // Register a session with a 1s timeout; it commits immediately.
        node = node
            .step(request(
                0xe1,
                Request::Register(RegisterRequest { client: "c1".into(), timeout: 1000 }),
            ))
            .unwrap();
        let responses = client_responses(drain(&rx));
        assert!(
            matches!(&responses[..], [(_, Ok(Response::Register(r)))] if r.session == 2),
            "unexpected {responses:?}"
        );

        // After 2 × timeout passes without keep-alives, the session expires.
        for _ in 0..21 {
            node = node.tick().unwrap();
        }
        assert!(
            node.status().sessions == 0,
            "expected session to expire, got {:?}",
            node.status()
        );
        drain(&rx);
    }

    #[test]
    // A higher term steps the leader down to follower.
    fn step_down_higher_term() {
        let (leader, rx) = setup();
        let node = Node::Leader(leader);
        let node = node
            .step(Envelope {
                from: Address::Node(2),
                to: Address::Node(1),
                term: 3,
                message: Message::Vote { last_index: 9, last_term: 3 },
            })
            .unwrap();
        assert_node(&node).is_follower().term(3);
        drain(&rx);
    }

    #[test]
    // The leader steps down when it cannot reach a quorum for an election
    // timeout, since another leader may exist behind the partition.
    fn step_down_quorum_timeout() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);
        for _ in 0..QUORUM_TIMEOUT {
            assert_node(&node).is_leader();
            node = node.tick().unwrap();
        }
        assert_node(&node).is_follower().term(2);
        drain(&rx);
    }

    #[test]
    // Heartbeats go out at the heartbeat interval while peers respond.
    fn tick_heartbeats() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);
        for _ in 0..HEARTBEAT_INTERVAL {
            assert_messages(&rx, vec![]);
            node = node.tick().unwrap();
            // Keep the quorum alive.
            node = node
                .step(msg(
                    2,
                    Message::AppendResponse { succeeded: true, last_index: 2, read_seq: 0 },
                ))
                .unwrap();
        }
        let heartbeats = drain(&rx);
        assert_eq!(2, heartbeats.len());
        for envelope in heartbeats {
            assert!(matches!(
                envelope.message,
                Message::Append { base_index: 2, base_term: 2, .. }
            ));
        }
    }

    #[test]
    // A rejected append probes backwards and retries.
    fn append_rejected_probes_back() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        node = node
            .step(msg(2, Message::AppendResponse { succeeded: false, last_index: 0, read_seq: 0 }))
            .unwrap();
        assert_node(&node).is_leader();
        let resends = drain(&rx);
        assert_eq!(1, resends.len());
        match &resends[0].message {
            Message::Append { base_index: 0, base_term: 0, entries, .. } => {
                assert_eq!(2, entries.len())
            }
            message => panic!("unexpected message {message:?}"),
        }
    }

    #[test]
    // A replica whose position has been compacted away receives a snapshot,
    // then resumes replication past it.
    fn install_snapshot_on_compacted_log() {
        let (mut leader, rx) = setup();

        // Compact the log through index 2 via a snapshot.
        let data = leader.driver.snapshot().unwrap();
        leader.log.take_snapshot(Snapshot { last_index: 2, last_term: 2, data }).unwrap();
        assert_eq!(3, leader.log.first_index());
        let mut node = Node::Leader(leader);

        // Peer 3 rejects an append from scratch: probing hits the compaction
        // point and switches to a snapshot transfer.
        node = node
            .step(msg(3, Message::AppendResponse { succeeded: false, last_index: 0, read_seq: 0 }))
            .unwrap();
        let messages = drain(&rx);
        assert_eq!(1, messages.len());
        let (id, complete) = match &messages[0].message {
            Message::Install { id, index: 2, last_term: 2, offset: 0, complete, .. } => {
                (*id, *complete)
            }
            message => panic!("unexpected message {message:?}"),
        };
        assert_eq!(2, id);
        assert!(complete, "snapshot fits one chunk");

        // The ack completes the transfer and replication resumes at base 2.
        let snapshot_len = match node {
            Node::Leader(ref leader) => leader.log.snapshot().unwrap().unwrap().data.len() as u64,
            _ => unreachable!(),
        };
        node = node
            .step(msg(3, Message::InstallResponse { succeeded: true, offset: snapshot_len }))
            .unwrap();
        assert_node(&node).is_leader();
        let messages = drain(&rx);
        assert_eq!(1, messages.len());
        assert!(matches!(
            messages[0].message,
            Message::Append { base_index: 2, base_term: 2, .. }
        ));
    }

    #[test]
    // A committed configuration change demoting the leader steps it down.
    fn reconfigure_demotes_leader() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        let mut members = active_members(&[1, 2, 3]);
        members[0].member_type = MemberType::Passive;
        node = node.step(request(0xf1, Request::Reconfigure(members))).unwrap();
        assert_node(&node).is_leader().last(3);
        drain(&rx);

        node = node
            .step(msg(2, Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 0 }))
            .unwrap();
        assert_node(&node).is_passive().committed(3).applied(3);
        let responses = client_responses(drain(&rx));
        assert_eq!(
            vec![(vec![0xf1], Ok(Response::Reconfigure(3)))],
            responses
        );
    }

    #[test]
    // Connect requests bind the session through the log and report the
    // leader and membership.
    fn connect_binds_session() {
        let (leader, rx) = setup();
        let mut node = Node::Leader(leader);

        node = node
            .step(request(
                0xf2,
                Request::Connect(ConnectRequest { client: "c1".into(), session: 1, connection: 1 }),
            ))
            .unwrap();
        assert_node(&node).is_leader().last(3).entry(Entry {
            index: 3,
            term: 2,
            kind: EntryKind::Connect { session: 1, node: 1 },
        });
        let responses = client_responses(drain(&rx));
        assert_eq!(1, responses.len());
        assert!(matches!(responses[0].1, Ok(Response::Connect(_))));
    }
}

