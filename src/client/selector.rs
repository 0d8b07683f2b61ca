/// Iteration state of the address selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// The selector has been reset and iteration has not started.
    Reset,
    /// The selector is iterating over addresses.
    Iterate,
    /// All addresses have been tried once.
    Complete,
}

/// Selects server addresses to connect to, in a stable order: the known
/// leader first (if any), then the remaining members. Each pass visits every
/// address once; reset() starts a new pass, and the leader hint is updated
/// from connect responses as the client learns about the cluster.
pub struct AddressSelector {
    /// The current leader hint, if any.
    leader: Option<String>,
    /// The known cluster member addresses.
    servers: Vec<String>,
    /// The addresses for the current pass.
    addresses: Vec<String>,
    /// The position of the next address in the current pass.
    position: usize,
    state: State,
}

impl AddressSelector {
    /// Creates a selector over the given member addresses.
    pub fn new(servers: Vec<String>) -> Self {
        let mut selector =
            Self { leader: None, servers, addresses: Vec::new(), position: 0, state: State::Reset };
        selector.rebuild();
        selector
    }

    /// Returns the current leader hint.
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Returns the known member addresses.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Returns the iteration state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Starts a new pass over the current members, leader first.
    pub fn reset(&mut self) {
        self.rebuild();
    }

    /// Updates the leader hint and membership, and starts a new pass.
    pub fn reset_with(&mut self, leader: Option<String>, servers: Vec<String>) {
        self.leader = leader;
        if !servers.is_empty() {
            self.servers = servers;
        }
        self.rebuild();
    }

    /// Returns true if the current pass has more addresses to try.
    pub fn has_next(&self) -> bool {
        self.position < self.addresses.len()
    }

    /// Returns the next address to try, or None once every address has been
    /// tried in this pass.
    pub fn next(&mut self) -> Option<String> {
        match self.addresses.get(self.position) {
            Some(address) => {
                self.position += 1;
                self.state =
                    if self.position < self.addresses.len() { State::Iterate } else { State::Complete };
                Some(address.clone())
            }
            None => {
                self.state = State::Complete;
                None
            }
        }
    }

    fn rebuild(&mut self) {
        self.addresses.clear();
        if let Some(leader) = &self.leader {
            self.addresses.push(leader.clone());
        }
        for server in &self.servers {
            if Some(server) != self.leader.as_ref() {
                self.addresses.push(server.clone());
            }
        }
        self.position = 0;
        self.state = State::Reset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addrs(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn iterates_members_once() {
        let mut selector = AddressSelector::new(addrs(&["a", "b", "c"]));
        assert_eq!(State::Reset, selector.state());
        assert!(selector.has_next());

        assert_eq!(Some("a".into()), selector.next());
        assert_eq!(State::Iterate, selector.state());
        assert_eq!(Some("b".into()), selector.next());
        assert_eq!(Some("c".into()), selector.next());
        assert_eq!(State::Complete, selector.state());
        assert!(!selector.has_next());
        assert_eq!(None, selector.next());
    }

    #[test]
    fn leader_first() {
        let mut selector = AddressSelector::new(addrs(&["a", "b", "c"]));
        selector.reset_with(Some("b".into()), addrs(&["a", "b", "c"]));
        assert_eq!(Some("b"), selector.leader());
        assert_eq!(Some("b".into()), selector.next());
        assert_eq!(Some("a".into()), selector.next());
        assert_eq!(Some("c".into()), selector.next());
        assert_eq!(None, selector.next());
    }

    #[test]
    fn reset_restarts_pass() {
        let mut selector = AddressSelector::new(addrs(&["a", "b"]));
        assert_eq!(Some("a".into()), selector.next());
        assert_eq!(Some("b".into()), selector.next());
        assert_eq!(State::Complete, selector.state());

        selector.reset();
        assert_eq!(State::Reset, selector.state());
        assert_eq!(Some("a".into()), selector.next());
    }

    #[test]
    fn reset_with_updates_membership() {
        let mut selector = AddressSelector::new(addrs(&["a", "b"]));
        selector.reset_with(Some("c".into()), addrs(&["b", "c", "d"]));
        assert_eq!(Some("c".into()), selector.next());
        assert_eq!(Some("b".into()), selector.next());
        assert_eq!(Some("d".into()), selector.next());
        assert_eq!(None, selector.next());

        // An empty membership update keeps the known servers.
        selector.reset_with(None, Vec::new());
        assert_eq!(addrs(&["b", "c", "d"]), selector.servers());
    }
}
