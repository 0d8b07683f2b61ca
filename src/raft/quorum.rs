/// A single-shot majority latch with two outcomes. Tracks successes and
/// failures among a fixed set of voters: once enough successes arrive the
/// outcome is true, and once success has become impossible the outcome is
/// false. Further votes after completion are ignored.
#[derive(Debug)]
pub struct Quorum {
    /// The number of successes required.
    quorum: u64,
    /// The total number of voters.
    total: u64,
    successes: u64,
    failures: u64,
    complete: bool,
}

impl Quorum {
    /// Creates a new quorum latch requiring `quorum` successes out of `total`
    /// voters.
    pub fn new(quorum: u64, total: u64) -> Self {
        assert!(quorum > 0 && quorum <= total, "invalid quorum {quorum} of {total}");
        Self { quorum, total, successes: 0, failures: 0, complete: false }
    }

    /// Records a success. Returns the outcome if this vote completed the
    /// quorum, or None if it is still undecided or already complete.
    pub fn succeed(&mut self) -> Option<bool> {
        if self.complete {
            return None;
        }
        self.successes += 1;
        if self.successes >= self.quorum {
            self.complete = true;
            return Some(true);
        }
        None
    }

    /// Records a failure. Returns the outcome if this vote made success
    /// impossible, or None if it is still undecided or already complete.
    pub fn fail(&mut self) -> Option<bool> {
        if self.complete {
            return None;
        }
        self.failures += 1;
        if self.total - self.failures < self.quorum {
            self.complete = true;
            return Some(false);
        }
        None
    }

    /// Returns true once the outcome has been decided.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}
