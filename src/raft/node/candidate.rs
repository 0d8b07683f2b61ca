use super::super::Quorum;
use super::*;

use log::{debug, info};

/// A candidate campaigns for leadership after winning a pre-vote poll. It
/// votes for itself and solicits votes from all active peers; a majority of
/// grants makes it leader, a message from a legitimate leader or a higher
/// term reverts it to follower, and a timeout starts a new election.
#[derive(Debug)]
pub struct Candidate {
    /// Grant/refuse votes from active members (including our own grant).
    /// Initialized by campaign().
    votes: Option<Quorum>,
    /// Ticks elapsed in the current election.
    election_duration: Ticks,
    /// The randomized timeout before a new election is started.
    election_timeout: Ticks,
}

impl Role for Candidate {}

impl Candidate {
    /// Creates a new candidate role.
    pub fn new() -> Self {
        Self { votes: None, election_duration: 0, election_timeout: rand_election_timeout() }
    }
}

impl Default for Candidate {
    fn default() -> Self {
        Self::new()
    }
}

impl RawNode<Candidate> {
    /// Starts the campaign for the current term: votes for ourselves and
    /// solicits votes from all active peers. The term and self-vote must
    /// already be persisted by the caller.
    pub(crate) fn campaign(&mut self) -> Result<()> {
        let peers = self.peers();
        let mut votes = Quorum::new(self.quorum_size(), peers.len() as u64 + 1);
        votes.succeed();
        self.role.votes = Some(votes);
        self.role.election_duration = 0;
        let (last_index, last_term) = self.log.get_last_index();
        self.send_to_all(&peers, Message::Vote { last_index, last_term })
    }

    /// Transforms the node into a follower, either because it lost the
    /// election (following the given leader) or because it discovered a
    /// higher term (leaderless).
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        if term > self.term {
            info!("Discovered new term {term}, reverting to follower");
            self.log.set_term(term, None)?;
            self.term = term;
            return Ok(self.into_role(Follower::new(leader, None)));
        }
        info!("Lost election, following leader in term {term}");
        let id = self.id;
        Ok(self.into_role(Follower::new(leader, Some(id))))
    }

    /// Transforms the node into a leader after winning the election.
    pub(crate) fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let mut node = self.into_role(Leader::new());
        node.assume()?;
        Ok(node)
    }

    /// Processes a message.
    pub fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if let Address::Node(from) = msg.from {
            // A higher term reverts us to follower and reprocesses.
            if msg.term > self.term {
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
            // A replication or configuration message in our term means a
            // leader was elected: revert to follower and reprocess.
            if matches!(
                msg.message,
                Message::Append { .. } | Message::Install { .. } | Message::Configure { .. }
            ) {
                let term = self.term;
                return self.into_follower(term, Some(from))?.step(msg);
            }
        }

        match msg.message {
            Message::VoteResponse { granted } => {
                let outcome = self.role.votes.as_mut().and_then(|votes| match granted {
                    true => votes.succeed(),
                    false => votes.fail(),
                });
                match outcome {
                    Some(true) => return Ok(self.into_leader()?.into()),
                    // An unwinnable election waits out the timeout, in case a
                    // leader emerges in this term.
                    Some(false) => debug!("Election unwinnable in term {}", self.term),
                    None => {}
                }
            }

            // We already voted for ourselves.
            Message::Vote { .. } => {
                self.send(msg.from, Message::VoteResponse { granted: false })?
            }

            // A straw poll is accepted purely on log freshness.
            Message::Poll { last_index, last_term } => {
                let (local_last_index, local_last_term) = self.log.get_last_index();
                let accepted = last_term > local_last_term
                    || (last_term == local_last_term && last_index >= local_last_index);
                self.send(msg.from, Message::PollResponse { accepted })?;
            }

            Message::ClientRequest { id, request } => {
                if let Some((id, _request)) = self.step_common_request(id, request, None)? {
                    self.respond(id, Err(Error::NoLeader))?;
                }
            }

            // Stale traffic from previous roles or elections; ignore.
            Message::PollResponse { .. }
            | Message::AppendResponse { .. }
            | Message::InstallResponse { .. }
            | Message::ConfigureResponse { .. } => {}

            Message::Append { .. } | Message::Install { .. } | Message::Configure { .. } => {
                unreachable!("handled above")
            }
            Message::ClientResponse { .. } | Message::Publish(_) => {
                panic!("received outbound message {:?}", msg.message)
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub fn tick(mut self) -> Result<Node> {
        self = self.advance_clock();
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            // The election timed out without a winner: start a new one in the
            // next term.
            let term = self.term + 1;
            info!("Election timed out, starting new election for term {term}");
            self.log.set_term(term, Some(self.id))?;
            self.term = term;
            self.role = Candidate::new();
            self.campaign()?;
        }
        Ok(self.into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{active_members, assert_messages, assert_node, drain, TestState};
    use super::*;
    use crate::raft::{EntryKind, Log};
    use crate::session::Driver;
    use crate::storage;

    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;

    /// Builds a campaigning candidate on node 1 of a 5-node cluster at term
    /// 4, with 3 log entries (terms 1,1,2) of which 2 are committed.
    fn setup() -> (RawNode<Candidate>, Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let mut log = Log::new(Box::new(storage::log::Memory::new())).unwrap();
        log.set_term(1, None).unwrap();
        log.append(EntryKind::Register { client: "c1".into(), timeout: 5000, timestamp: 0 })
            .unwrap();
        log.append(EntryKind::Command { session: 1, sequence: 1, timestamp: 0, command: vec![2] })
            .unwrap();
        log.set_term(2, None).unwrap();
        log.append(EntryKind::Command { session: 1, sequence: 2, timestamp: 0, command: vec![3] })
            .unwrap();
        log.commit(2).unwrap();
        log.set_term(4, Some(1)).unwrap();

        let mut driver = Driver::new(Box::new(TestState::new()));
        driver.apply(log.get(1).unwrap().unwrap()).unwrap();
        driver.apply(log.get(2).unwrap().unwrap()).unwrap();

        let mut node = RawNode {
            id: 1,
            members: active_members(&[1, 2, 3, 4, 5]),
            term: 4,
            log,
            driver,
            node_tx,
            clock: 1000,
            config_index: 0,
            role: Candidate::new(),
        };
        node.campaign().unwrap();
        (node, node_rx)
    }

    fn msg(from: NodeID, term: Term, message: Message) -> Envelope {
        Envelope { from: Address::Node(from), to: Address::Node(1), term, message }
    }

    #[test]
    // The campaign solicits votes from all peers.
    fn campaign_solicits_votes() {
        let (_candidate, rx) = setup();
        let votes = drain(&rx);
        assert_eq!(4, votes.len());
        for (i, to) in [2, 3, 4, 5].into_iter().enumerate() {
            assert_eq!(
                votes[i],
                Envelope {
                    from: Address::Node(1),
                    to: Address::Node(to),
                    term: 4,
                    message: Message::Vote { last_index: 3, last_term: 2 },
                }
            );
        }
    }

    #[test]
    // A majority of granted votes (2 peers + self) wins the election. The
    // new leader appends an initialize entry and heartbeats the cluster.
    fn step_voteresponse_wins() {
        let (candidate, rx) = setup();
        drain(&rx);
        let mut node = Node::Candidate(candidate);

        node = node.step(msg(2, 4, Message::VoteResponse { granted: true })).unwrap();
        assert_node(&node).is_candidate().term(4);

        node = node.step(msg(3, 4, Message::VoteResponse { granted: true })).unwrap();
        assert_node(&node).is_leader().term(4).last(4).entry(Entry {
            index: 4,
            term: 4,
            kind: EntryKind::Initialize { timestamp: 1000 },
        });
        // The assumption heartbeat replicates to all peers.
        let appends = drain(&rx);
        assert_eq!(4, appends.len());
        for envelope in appends {
            assert!(
                matches!(envelope.message, Message::Append { base_index: 3, base_term: 2, .. }),
                "unexpected {envelope:?}"
            );
        }
    }

    #[test]
    // Refused votes making the election unwinnable leave the candidate
    // waiting out its timeout.
    fn step_voteresponse_unwinnable() {
        let (candidate, rx) = setup();
        drain(&rx);
        let mut node = Node::Candidate(candidate);

        for peer in [2, 3, 4] {
            node = node.step(msg(peer, 4, Message::VoteResponse { granted: false })).unwrap();
        }
        assert_node(&node).is_candidate().term(4);
        assert_messages(&rx, vec![]);
    }

    #[test]
    // An append in the current term means someone else won: revert to
    // follower and process the append.
    fn step_append_loses_election() {
        let (candidate, rx) = setup();
        drain(&rx);

        let node = candidate
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
        assert_node(&node).is_follower().term(4);
        assert_messages(
            &rx,
            vec![Envelope {
                from: Address::Node(1),
                to: Address::Node(3),
                term: 4,
                message: Message::AppendResponse { succeeded: true, last_index: 3, read_seq: 0 },
            }],
        );
    }

    #[test]
    // A higher term reverts to follower.
    fn step_higher_term() {
        let (candidate, rx) = setup();
        drain(&rx);

        let node = candidate
            .step(msg(5, 6, Message::Vote { last_index: 9, last_term: 5 }))
            .unwrap();
        assert_node(&node).is_follower().term(6).voted_for(Some(5));
        assert_messages(
            &rx,
            vec![Envelope {
                from: Address::Node(1),
                to: Address::Node(5),
                term: 6,
                message: Message::VoteResponse { granted: true },
            }],
        );
    }

    #[test]
    // The election timeout starts a new election in the next term.
    fn tick_new_election() {
        let (candidate, rx) = setup();
        let timeout = candidate.role.election_timeout;
        drain(&rx);
        let mut node = Node::Candidate(candidate);

        for _ in 0..timeout {
            assert_node(&node).is_candidate().term(4);
            node = node.tick().unwrap();
        }
        assert_node(&node).is_candidate().term(5);
        let votes = drain(&rx);
        assert_eq!(4, votes.len());
        for envelope in votes {
            assert_eq!(
                envelope.message,
                Message::Vote { last_index: 3, last_term: 2 },
            );
            assert_eq!(envelope.term, 5);
        }
    }

    #[test]
    // Client requests other than connect/status get NoLeader.
    fn step_client_request() {
        let (candidate, rx) = setup();
        drain(&rx);
        let node = candidate
            .step(Envelope {
                from: Address::Client,
                to: Address::Node(1),
                term: 0,
                message: Message::ClientRequest {
                    id: vec![0x01],
                    request: crate::protocol::Request::Register(crate::protocol::RegisterRequest {
                        client: "c1".into(),
                        timeout: 5000,
                    }),
                },
            })
            .unwrap();
        assert_node(&node).is_candidate().term(4);
        assert_messages(
            &rx,
            vec![Envelope {
                from: Address::Node(1),
                to: Address::Client,
                term: 4,
                message: Message::ClientResponse { id: vec![0x01], response: Err(Error::NoLeader) },
            }],
        );
    }
}
