use super::super::Quorum;
use super::*;

use log::{debug, info};

/// A follower replicates state from a leader, and polls its peers for an
/// election when the leader goes quiet.
#[derive(Debug)]
pub struct Follower {
    /// The leader, or None if just initialized.
    pub(crate) leader: Option<NodeID>,
    /// The node we voted for in the current term, if any.
    pub(crate) voted_for: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The randomized timeout before polling for an election.
    election_timeout: Ticks,
    /// An in-flight pre-vote poll, if any. The follower only becomes a
    /// candidate once a majority of active members accept the poll.
    poll: Option<Poll>,
    /// An in-progress snapshot install from the leader, if any.
    installing: Option<Installing>,
    /// The leader-reported highest index stored on every member, bounding
    /// local log compaction.
    global_index: Index,
}

/// A pre-vote poll in progress.
#[derive(Debug)]
struct Poll {
    /// Accept/reject votes from active members (including our own accept).
    quorum: Quorum,
    /// Ticks since the poll was sent; an undecided poll is abandoned after an
    /// election timeout.
    elapsed: Ticks,
}

impl Role for Follower {}

impl Follower {
    /// Creates a new follower role.
    pub fn new(leader: Option<NodeID>, voted_for: Option<NodeID>) -> Self {
        Self {
            leader,
            voted_for,
            leader_seen: 0,
            election_timeout: rand_election_timeout(),
            poll: None,
            installing: None,
            global_index: 0,
        }
    }
}

impl RawNode<Follower> {
    /// Checks if the message sender is the current leader.
    fn is_leader(&self, from: Address) -> bool {
        matches!(from, Address::Node(id) if self.role.leader == Some(id))
    }

    /// Returns true if the given log position is at least as up-to-date as
    /// our own, per the Raft §5.4.1 election restriction.
    fn log_up_to_date(&self, last_index: Index, last_term: Term) -> bool {
        let (local_last_index, local_last_term) = self.log.get_last_index();
        last_term > local_last_term
            || (last_term == local_last_term && last_index >= local_last_index)
    }

    /// Transforms the node into a candidate after winning a pre-vote poll.
    pub(crate) fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        info!("Starting election for term {}", self.term + 1);
        let term = self.term + 1;
        self.log.set_term(term, Some(self.id))?;
        self.term = term;
        let mut node = self.into_role(Candidate::new());
        node.campaign()?;
        Ok(node)
    }

    /// Processes a message.
    pub fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        // A higher term from a cluster member converts us to a leaderless
        // follower in that term, then processes the message.
        if let Address::Node(_) = msg.from {
            if msg.term > self.term {
                info!("Discovered new term {}", msg.term);
                self.log.set_term(msg.term, None)?;
                self.term = msg.term;
                self.role = Follower::new(None, None);
            }
            // Reject or ignore messages from stale terms.
            if msg.term < self.term {
                match msg.message {
                    Message::Append { read_seq, .. } => {
                        self.send(
                            msg.from,
                            Message::AppendResponse {
                                succeeded: false,
                                last_index: self.log.get_last_index().0,
                                read_seq,
                            },
                        )?;
                    }
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
        }

        if self.is_leader(msg.from) {
            self.role.leader_seen = 0;
            self.role.poll = None;
        }

        match msg.message {
            Message::Append { base_index, base_term, commit_index, global_index, read_seq, entries } => {
                let from = msg.from.unwrap_node();
                match self.role.leader {
                    // Discovering a leader in the current term resets the
                    // election timeout.
                    None => {
                        info!("Following leader {from} in term {}", self.term);
                        self.role =
                            Follower::new(Some(from), self.role.voted_for.take());
                    }
                    Some(leader) => {
                        assert_eq!(leader, from, "multiple leaders in term {}", self.term)
                    }
                }
                self.role.leader_seen = 0;
                self.role.global_index = global_index;

                if !self.log.has(base_index, base_term)? {
                    debug!("Rejecting append at base {base_index}");
                    self.send(
                        msg.from,
                        Message::AppendResponse {
                            succeeded: false,
                            last_index: self.log.get_last_index().0,
                            read_seq,
                        },
                    )?;
                    return Ok(self.into());
                }
                let last_index = self.log.splice(entries)?;
                let commit_to = commit_index.min(last_index);
                if commit_to > self.log.get_commit_index().0 {
                    self.log.commit(commit_to)?;
                    self.maybe_apply()?;
                }
                self.send(
                    msg.from,
                    Message::AppendResponse { succeeded: true, last_index, read_seq },
                )?;
                return self.reconcile_membership();
            }

            Message::Poll { last_index, last_term } => {
                // A poll is a straw vote: it consumes no real vote and does
                // not reset timers, it only reports whether we would vote.
                let accepted = self.log_up_to_date(last_index, last_term);
                self.send(msg.from, Message::PollResponse { accepted })?;
            }

            Message::PollResponse { accepted } => {
                if let Some(poll) = self.role.poll.as_mut() {
                    let outcome = match accepted {
                        true => poll.quorum.succeed(),
                        false => poll.quorum.fail(),
                    };
                    match outcome {
                        Some(true) => return Ok(self.into_candidate()?.into()),
                        Some(false) => {
                            debug!("Poll rejected by majority, remaining follower");
                            self.role.poll = None;
                            self.role.leader_seen = 0;
                            self.role.election_timeout = rand_election_timeout();
                        }
                        None => {}
                    }
                }
            }

            Message::Vote { last_index, last_term } => {
                let from = msg.from.unwrap_node();
                let granted = match self.role.voted_for {
                    Some(voted_for) => voted_for == from,
                    None => self.log_up_to_date(last_index, last_term),
                };
                if granted && self.role.voted_for.is_none() {
                    info!("Voting for {from} in term {} election", self.term);
                    self.log.set_term(self.term, Some(from))?;
                    self.role.voted_for = Some(from);
                    self.role.leader_seen = 0;
                }
                self.send(msg.from, Message::VoteResponse { granted })?;
            }

            Message::Install { id, index, last_term, offset, data, complete } => {
                if self.is_leader(msg.from) {
                    let mut installing = self.role.installing.take();
                    let response = self.step_install(
                        &mut installing,
                        id,
                        index,
                        last_term,
                        offset,
                        data,
                        complete,
                    )?;
                    self.role.installing = installing;
                    self.send(msg.from, response)?;
                }
            }

            Message::Configure { index, members } => {
                self.members = members;
                self.send(msg.from, Message::ConfigureResponse { index })?;
                return self.reconcile_membership();
            }

            Message::ClientRequest { id, request } => {
                let leader = self.role.leader;
                if let Some((id, _request)) = self.step_common_request(id, request, leader)? {
                    // Everything else needs the leader; the client will learn
                    // it from a connect and try there.
                    self.respond(id, Err(Error::NoLeader))?;
                }
            }

            // Stale responses from a past role; ignore.
            Message::VoteResponse { .. }
            | Message::AppendResponse { .. }
            | Message::InstallResponse { .. }
            | Message::ConfigureResponse { .. } => {}

            Message::ClientResponse { .. } | Message::Publish(_) => {
                panic!("received outbound message {:?}", msg.message)
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub fn tick(mut self) -> Result<Node> {
        self = self.advance_clock();
        self.role.leader_seen += 1;

        let timeout = self.role.election_timeout;
        match self.role.poll.as_mut() {
            Some(poll) => {
                poll.elapsed += 1;
                // Abandon an undecided poll after an election timeout.
                if poll.elapsed >= timeout {
                    debug!("Poll timed out, resetting election timer");
                    self.role.poll = None;
                    self.role.leader_seen = 0;
                    self.role.election_timeout = rand_election_timeout();
                }
            }
            None if self.role.leader_seen >= timeout => return self.start_poll(),
            None => {}
        }

        let bound = self.role.global_index;
        self.maybe_compact(bound)?;
        Ok(self.into())
    }

    /// Begins a pre-vote poll: asks all active peers whether they would vote
    /// for us at our current term and log position. Only a majority of
    /// accepts advances us to a real candidacy, so an isolated node cannot
    /// inflate the term by campaigning against a healthy cluster.
    fn start_poll(mut self) -> Result<Node> {
        let peers = self.peers();
        if peers.is_empty() {
            return Ok(self.into_candidate()?.into());
        }
        info!("Heartbeat timed out, polling members for election in term {}", self.term + 1);
        self.role.leader = None;
        let mut quorum = Quorum::new(self.quorum_size(), peers.len() as u64 + 1);
        // Our own implicit accept.
        quorum.succeed();
        self.role.poll = Some(Poll { quorum, elapsed: 0 });
        let (last_index, last_term) = self.log.get_last_index();
        self.send_to_all(&peers, Message::Poll { last_index, last_term })?;
        Ok(self.into())
    }

    /// Reconciles the node's role against the current configuration, after a
    /// membership change.
    fn reconcile_membership(self) -> Result<Node> {
        match self.my_type() {
            MemberType::Active => Ok(self.into()),
            MemberType::Passive => {
                info!("Demoted to passive member");
                Ok(self.into_role(Passive::new()).into())
            }
            MemberType::Reserve => {
                info!("Demoted to reserve member");
                Ok(self.into_role(Reserve::new()).into())
            }
            MemberType::Inactive => {
                info!("Removed from cluster, becoming inactive");
                Ok(self.into_role(Inactive).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{active_members, assert_messages, assert_node, drain, TestState};
    use super::*;
    use crate::protocol::Request;
    use crate::raft::{EntryKind, Log};
    use crate::session::Driver;
    use crate::storage;

    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;

    fn command(n: u8) -> EntryKind {
        EntryKind::Command { session: 1, sequence: n as u64, timestamp: 0, command: vec![n] }
    }

    fn entry(index: Index, term: Term, n: u8) -> Entry {
        Entry { index, term, kind: command(n) }
    }

    /// Builds a follower on node 1 of a 5-node cluster, with leader 2, log
    /// entries 1-3 (terms 1,1,2) and commit index 2, at term 3. The session
    /// registered at entry 1 keeps the applied commands meaningful.
    fn setup() -> (RawNode<Follower>, Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let mut log = Log::new(Box::new(storage::log::Memory::new())).unwrap();
        log.set_term(1, None).unwrap();
        log.append(EntryKind::Register { client: "c1".into(), timeout: 5000, timestamp: 0 })
            .unwrap();
        log.append(command(2)).unwrap();
        log.set_term(2, None).unwrap();
        log.append(command(3)).unwrap();
        log.set_term(3, None).unwrap();
        log.commit(2).unwrap();

        let mut driver = Driver::new(Box::new(TestState::new()));
        driver.apply(log.get(1).unwrap().unwrap()).unwrap();
        driver.apply(log.get(2).unwrap().unwrap()).unwrap();

        let node = RawNode {
            id: 1,
            members: active_members(&[1, 2, 3, 4, 5]),
            term: 3,
            log,
            driver,
            node_tx,
            clock: 1000,
            config_index: 0,
            role: Follower::new(Some(2), None),
        };
        (node, node_rx)
    }

    fn msg(from: NodeID, term: Term, message: Message) -> Envelope {
        Envelope { from: Address::Node(from), to: Address::Node(1), term, message }
    }

    fn response(to: NodeID, term: Term, message: Message) -> Envelope {
        Envelope { from: Address::Node(1), to: Address::Node(to), term, message }
    }

    #[test]
    // An empty append from the leader works as a heartbeat: it advances the
    // commit index and applies entries.
    fn step_append_heartbeat() {
        let (follower, rx) = setup();
        let node = follower
            .step(msg(
                2,
                3,
                Message::Append {
                    base_index: 3,
                    base_term: 2,
                    commit_index: 3,
                    global_index: 0,
                    read_seq: 7,
                    entries: vec![],
                },
            ))
            .unwrap();
        assert_node(&node).is_follower().term(3).leader(Some(2)).committed(3).applied(3);
        assert_messages(
            &rx,
            vec![response(
                2,
                3,
                Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 7 },
            )],
        );
    }

    #[test]
    // Appends with new entries are spliced and acknowledged.
    fn step_append_entries() {
        let (follower, rx) = setup();
        let node = follower
            .step(msg(
                2,
                3,
                Message::Append {
                    base_index: 3,
                    base_term: 2,
                    commit_index: 2,
                    global_index: 0,
                    read_seq: 0,
                    entries: vec![entry(4, 3, 4), entry(5, 3, 5)],
                },
            ))
            .unwrap();
        assert_node(&node).is_follower().term(3).last(5).committed(2);
        assert_messages(
            &rx,
            vec![response(
                2,
                3,
                Message::AppendResponse { succeeded: true, last_index: 5, read_seq: 0 },
            )],
        );
    }

    #[test]
    // Appends whose base position is missing or conflicting are rejected,
    // reporting our last index as a probe hint.
    fn step_append_base_mismatch() {
        let (follower, rx) = setup();
        let mut node = Node::Follower(follower);
        for (base_index, base_term) in [(5, 2), (3, 1)] {
            node = node
                .step(msg(
                    2,
                    3,
                    Message::Append {
                        base_index,
                        base_term,
                        commit_index: 2,
                        global_index: 0,
                        read_seq: 0,
                        entries: vec![entry(base_index + 1, 3, 9)],
                    },
                ))
                .unwrap();
            assert_node(&node).is_follower().term(3).last(3).committed(2);
            assert_messages(
                &rx,
                vec![response(
                    2,
                    3,
                    Message::AppendResponse { succeeded: false, last_index: 3, read_seq: 0 },
                )],
            );
        }
    }

    #[test]
    // A conflicting suffix is truncated and replaced.
    fn step_append_conflict_truncates() {
        let (follower, rx) = setup();
        let node = follower
            .step(msg(
                2,
                3,
                Message::Append {
                    base_index: 2,
                    base_term: 1,
                    commit_index: 2,
                    global_index: 0,
                    read_seq: 0,
                    entries: vec![entry(3, 3, 7), entry(4, 3, 8)],
                },
            ))
            .unwrap();
        assert_node(&node)
            .is_follower()
            .term(3)
            .last(4)
            .entry(entry(3, 3, 7))
            .entry(entry(4, 3, 8));
        assert_messages(
            &rx,
            vec![response(
                2,
                3,
                Message::AppendResponse { succeeded: true, last_index: 4, read_seq: 0 },
            )],
        );
    }

    #[test]
    // An append from a future term adopts the term and follows the sender.
    fn step_append_future_term() {
        let (follower, rx) = setup();
        let node = follower
            .step(msg(
                3,
                4,
                Message::Append {
                    base_index: 3,
                    base_term: 2,
                    commit_index: 2,
                    global_index: 0,
                    read_seq: 0,
                    entries: vec![],
                },
            ))
            .unwrap();
        assert_node(&node).is_follower().term(4).leader(Some(3)).voted_for(None);
        assert_messages(
            &rx,
            vec![response(
                3,
                4,
                Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 0 },
            )],
        );
    }

    #[test]
    // An append from a stale term is rejected without following the sender.
    fn step_append_past_term() {
        let (follower, rx) = setup();
        let node = follower
            .step(msg(
                3,
                2,
                Message::Append {
                    base_index: 0,
                    base_term: 0,
                    commit_index: 0,
                    global_index: 0,
                    read_seq: 0,
                    entries: vec![],
                },
            ))
            .unwrap();
        assert_node(&node).is_follower().term(3).leader(Some(2));
        assert_messages(
            &rx,
            vec![response(
                3,
                3,
                Message::AppendResponse { succeeded: false, last_index: 3, read_seq: 0 },
            )],
        );
    }

    #[test]
    // Polls are accepted iff the poller's log is at least as fresh, without
    // consuming a vote or resetting timers.
    fn step_poll() {
        let (follower, rx) = setup();
        let mut node = Node::Follower(follower);
        for (last_index, last_term, accepted) in [
            (3, 2, true),
            (4, 2, true),
            (3, 3, true),
            (2, 2, false),
            (3, 1, false),
        ] {
            node = node.step(msg(4, 3, Message::Poll { last_index, last_term })).unwrap();
            assert_node(&node).is_follower().term(3).voted_for(None);
            assert_messages(&rx, vec![response(4, 3, Message::PollResponse { accepted })]);
        }
    }

    #[test]
    // A vote is granted once per term, to the first fresh candidate only.
    fn step_vote() {
        let (follower, rx) = setup();

        let node = follower.step(msg(3, 3, Message::Vote { last_index: 3, last_term: 2 })).unwrap();
        assert_node(&node).is_follower().term(3).voted_for(Some(3));
        assert_messages(&rx, vec![response(3, 3, Message::VoteResponse { granted: true })]);

        // A repeated request from the same candidate is granted again.
        let node = node.step(msg(3, 3, Message::Vote { last_index: 3, last_term: 2 })).unwrap();
        assert_messages(&rx, vec![response(3, 3, Message::VoteResponse { granted: true })]);

        // A request from another candidate in the same term is refused.
        let node = node.step(msg(4, 3, Message::Vote { last_index: 9, last_term: 3 })).unwrap();
        assert_node(&node).is_follower().term(3).voted_for(Some(3));
        assert_messages(&rx, vec![response(4, 3, Message::VoteResponse { granted: false })]);
    }

    #[test]
    // Votes are refused for candidates with stale logs.
    fn step_vote_stale_log() {
        let (follower, rx) = setup();
        let node = follower.step(msg(3, 3, Message::Vote { last_index: 2, last_term: 2 })).unwrap();
        assert_node(&node).is_follower().term(3).voted_for(None);
        assert_messages(&rx, vec![response(3, 3, Message::VoteResponse { granted: false })]);
    }

    #[test]
    // The election timeout triggers a poll at the current term, and a
    // majority of accepts starts a real election at term + 1.
    fn tick_poll_then_election() {
        let (follower, rx) = setup();
        let timeout = follower.role.election_timeout;
        let mut node = Node::Follower(follower);

        for _ in 0..timeout {
            node = node.tick().unwrap();
        }
        // The poll goes to all four peers at the current term.
        assert_node(&node).is_follower().term(3);
        let polls = drain(&rx);
        assert_eq!(4, polls.len());
        for (i, to) in [2, 3, 4, 5].into_iter().enumerate() {
            assert_eq!(
                polls[i],
                response(to, 3, Message::Poll { last_index: 3, last_term: 2 })
            );
        }

        // Two accepts (plus our own) reach the quorum of three: the node
        // becomes a candidate at term 4 and solicits votes.
        node = node.step(msg(2, 3, Message::PollResponse { accepted: true })).unwrap();
        assert_node(&node).is_follower().term(3);
        node = node.step(msg(3, 3, Message::PollResponse { accepted: true })).unwrap();
        assert_node(&node).is_candidate().term(4);
        let votes = drain(&rx);
        assert_eq!(4, votes.len());
        for (i, to) in [2, 3, 4, 5].into_iter().enumerate() {
            assert_eq!(votes[i], response(to, 4, Message::Vote { last_index: 3, last_term: 2 }));
        }
    }

    #[test]
    // A rejected poll leaves the term unchanged: a partitioned node cannot
    // disrupt a healthy cluster by term inflation.
    fn poll_rejected_no_term_bump() {
        let (follower, rx) = setup();
        let timeout = follower.role.election_timeout;
        let mut node = Node::Follower(follower);

        for _ in 0..timeout {
            node = node.tick().unwrap();
        }
        drain(&rx);

        // A majority of rejections (3 of 4 peers, quorum 3 unreachable with
        // our own single accept) abandons the poll at term 3.
        for peer in [2, 3, 4] {
            node = node.step(msg(peer, 3, Message::PollResponse { accepted: false })).unwrap();
            assert_node(&node).is_follower().term(3);
        }
        assert_messages(&rx, vec![]);

        // A later heartbeat from the leader is accepted without a term bump.
        node = node
            .step(msg(
                2,
                3,
                Message::Append {
                    base_index: 3,
                    base_term: 2,
                    commit_index: 2,
                    global_index: 0,
                    read_seq: 0,
                    entries: vec![],
                },
            ))
            .unwrap();
        assert_node(&node).is_follower().term(3).leader(Some(2));
    }

    #[test]
    // Heartbeats reset the election timer: no poll fires while the leader is
    // heard from.
    fn tick_heartbeat_resets_timer() {
        let (follower, rx) = setup();
        let timeout = follower.role.election_timeout;
        let mut node = Node::Follower(follower);

        for _ in 0..(3 * timeout as u64) {
            node = node.tick().unwrap();
            node = node
                .step(msg(
                    2,
                    3,
                    Message::Append {
                        base_index: 3,
                        base_term: 2,
                        commit_index: 2,
                        global_index: 0,
                        read_seq: 0,
                        entries: vec![],
                    },
                ))
                .unwrap();
            drain(&rx);
            assert_node(&node).is_follower().term(3).leader(Some(2));
        }
    }

    #[test]
    // Client operations other than connect/status are refused without a
    // leader connection, with a NoLeader error.
    fn step_client_request_no_leader() {
        let (follower, rx) = setup();
        let node = follower
            .step(Envelope {
                from: Address::Client,
                to: Address::Node(1),
                term: 0,
                message: Message::ClientRequest {
                    id: vec![0x01],
                    request: Request::Command(crate::protocol::CommandRequest {
                        session: 1,
                        sequence: 1,
                        command: Some(vec![0xaf]),
                    }),
                },
            })
            .unwrap();
        assert_node(&node).is_follower().term(3);
        assert_messages(
            &rx,
            vec![Envelope {
                from: Address::Node(1),
                to: Address::Client,
                term: 3,
                message: Message::ClientResponse { id: vec![0x01], response: Err(Error::NoLeader) },
            }],
        );
    }

    #[test]
    // Connect requests are served by any role, reporting leader and members.
    fn step_client_connect() {
        let (follower, rx) = setup();
        let members = follower.members.clone();
        let node = follower
            .step(Envelope {
                from: Address::Client,
                to: Address::Node(1),
                term: 0,
                message: Message::ClientRequest {
                    id: vec![0x02],
                    request: Request::Connect(crate::protocol::ConnectRequest {
                        client: "c1".into(),
                        session: 0,
                        connection: 1,
                    }),
                },
            })
            .unwrap();
        assert_node(&node).is_follower().term(3);
        assert_messages(
            &rx,
            vec![Envelope {
                from: Address::Node(1),
                to: Address::Client,
                term: 3,
                message: Message::ClientResponse {
                    id: vec![0x02],
                    response: Ok(crate::protocol::Response::Connect(
                        crate::protocol::ConnectResponse {
                            leader: Some("127.0.0.1:9602".into()),
                            members,
                        },
                    )),
                },
            }],
        );
    }

    #[test]
    // A configuration push demoting us to passive changes the role.
    fn step_configure_demotion() {
        let (follower, rx) = setup();
        let mut members = active_members(&[1, 2, 3, 4, 5]);
        members[0].member_type = MemberType::Passive;
        let node = follower
            .step(msg(2, 3, Message::Configure { index: 4, members }))
            .unwrap();
        assert_node(&node).is_passive();
        assert_messages(&rx, vec![response(2, 3, Message::ConfigureResponse { index: 4 })]);
    }
}
