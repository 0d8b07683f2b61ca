use super::*;

use log::info;

/// A passive member receives log replication and snapshot installs but does
/// not vote or count toward the commit quorum. Configuration changes may
/// promote it to a full voting member.
#[derive(Debug)]
pub struct Passive {
    /// The replicating leader, if known.
    leader: Option<NodeID>,
    /// An in-progress snapshot install from the leader, if any.
    installing: Option<Installing>,
    /// The leader-reported highest index stored on every member, bounding
    /// local log compaction.
    global_index: Index,
}

impl Role for Passive {}

impl Passive {
    pub fn new() -> Self {
        Self { leader: None, installing: None, global_index: 0 }
    }
}

impl Default for Passive {
    fn default() -> Self {
        Self::new()
    }
}

impl RawNode<Passive> {
    /// Processes a message.
    pub fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if let Address::Node(_) = msg.from {
            if msg.term > self.term {
                self.log.set_term(msg.term, None)?;
                self.term = msg.term;
                self.role.leader = None;
            }
            if msg.term < self.term {
                if let Message::Append { read_seq, .. } = msg.message {
                    self.send(
                        msg.from,
                        Message::AppendResponse {
                            succeeded: false,
                            last_index: self.log.get_last_index().0,
                            read_seq,
                        },
                    )?;
                }
                return Ok(self.into());
            }
        }

        match msg.message {
            Message::Append { base_index, base_term, commit_index, global_index, read_seq, entries } => {
                let from = msg.from.unwrap_node();
                self.role.leader = Some(from);
                self.role.global_index = global_index;
                if !self.log.has(base_index, base_term)? {
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

            // Passive members do not vote.
            Message::Poll { .. } => {
                self.send(msg.from, Message::PollResponse { accepted: false })?
            }
            Message::Vote { .. } => {
                self.send(msg.from, Message::VoteResponse { granted: false })?
            }

            Message::Install { id, index, last_term, offset, data, complete } => {
                let mut installing = self.role.installing.take();
                let response =
                    self.step_install(&mut installing, id, index, last_term, offset, data, complete)?;
                self.role.installing = installing;
                self.send(msg.from, response)?;
            }

            Message::Configure { index, members } => {
                self.members = members;
                self.send(msg.from, Message::ConfigureResponse { index })?;
                return self.reconcile_membership();
            }

            Message::ClientRequest { id, request } => {
                let leader = self.role.leader;
                if let Some((id, _request)) = self.step_common_request(id, request, leader)? {
                    self.respond(id, Err(Error::IllegalMemberState))?;
                }
            }

            Message::AppendResponse { .. }
            | Message::PollResponse { .. }
            | Message::VoteResponse { .. }
            | Message::InstallResponse { .. }
            | Message::ConfigureResponse { .. } => {}

            Message::ClientResponse { .. } | Message::Publish(_) => {
                panic!("received outbound message {:?}", msg.message)
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. Passive members have no timers beyond
    /// compaction.
    pub fn tick(mut self) -> Result<Node> {
        self = self.advance_clock();
        let bound = self.role.global_index;
        self.maybe_compact(bound)?;
        Ok(self.into())
    }

    /// Reconciles the node's role against the current configuration.
    fn reconcile_membership(self) -> Result<Node> {
        match self.my_type() {
            MemberType::Passive => Ok(self.into()),
            MemberType::Active => {
                info!("Promoted to active member");
                {
                    let leader = self.role.leader;
                    Ok(self.into_role(Follower::new(leader, None)).into())
                }
            }
            MemberType::Reserve => Ok(self.into_role(Reserve::new()).into()),
            MemberType::Inactive => Ok(self.into_role(Inactive).into()),
        }
    }
}

/// A reserve member receives only configuration updates and snapshot
/// installs, keeping it warm enough to be promoted by a configuration
/// change without burdening the cluster with log replication.
#[derive(Debug)]
pub struct Reserve {
    installing: Option<Installing>,
}

impl Role for Reserve {}

impl Reserve {
    pub fn new() -> Self {
        Self { installing: None }
    }
}

impl Default for Reserve {
    fn default() -> Self {
        Self::new()
    }
}

impl RawNode<Reserve> {
    /// Processes a message.
    pub fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        if let Address::Node(_) = msg.from {
            if msg.term > self.term {
                self.log.set_term(msg.term, None)?;
                self.term = msg.term;
            }
            if msg.term < self.term {
                return Ok(self.into());
            }
        }

        match msg.message {
            Message::Configure { index, members } => {
                self.members = members;
                self.send(msg.from, Message::ConfigureResponse { index })?;
                return self.reconcile_membership();
            }

            Message::Install { id, index, last_term, offset, data, complete } => {
                let mut installing = self.role.installing.take();
                let response =
                    self.step_install(&mut installing, id, index, last_term, offset, data, complete)?;
                self.role.installing = installing;
                self.send(msg.from, response)?;
            }

            Message::Poll { .. } => {
                self.send(msg.from, Message::PollResponse { accepted: false })?
            }
            Message::Vote { .. } => {
                self.send(msg.from, Message::VoteResponse { granted: false })?
            }

            Message::ClientRequest { id, request } => {
                if let Some((id, _request)) = self.step_common_request(id, request, None)? {
                    self.respond(id, Err(Error::IllegalMemberState))?;
                }
            }

            Message::ClientResponse { .. } | Message::Publish(_) => {
                panic!("received outbound message {:?}", msg.message)
            }

            _ => {}
        }
        Ok(self.into())
    }

    /// Reconciles the node's role against the current configuration.
    fn reconcile_membership(self) -> Result<Node> {
        match self.my_type() {
            MemberType::Reserve => Ok(self.into()),
            MemberType::Active => {
                info!("Promoted to active member");
                Ok(self.into_role(Follower::new(None, None)).into())
            }
            MemberType::Passive => {
                info!("Promoted to passive member");
                Ok(self.into_role(Passive::new()).into())
            }
            MemberType::Inactive => Ok(self.into_role(Inactive).into()),
        }
    }
}

/// An inactive member: the initial and terminal state of a removed or
/// not-yet-joined server. Accepts no requests; it only rejoins via an
/// out-of-band configuration change and restart.
#[derive(Debug)]
pub struct Inactive;

impl Role for Inactive {}

impl RawNode<Inactive> {
    /// Processes a message. Client requests are refused; everything else is
    /// dropped.
    pub fn step(self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);
        if let Message::ClientRequest { id, .. } = msg.message {
            self.respond(id, Err(Error::IllegalMemberState))?;
        }
        Ok(self.into())
    }
}
