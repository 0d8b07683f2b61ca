use crate::raft::Index;

use std::collections::{HashMap, VecDeque};

/// A callback fired when its response or event reaches its place in the
/// sequence. The sequencer lives on the client's driver thread, so callbacks
/// need not be Send.
pub type Callback = Box<dyn FnOnce()>;

/// Sequencing information from an operation response. Error responses carry
/// no information and are sequenced purely by request order.
#[derive(Clone, Copy, Debug)]
pub struct ResponseInfo {
    /// The session's event index at the time the operation completed. All
    /// events at or below it fire before the response's callback.
    pub event_index: Index,
}

/// Sequencing information from a publish request.
#[derive(Clone, Copy, Debug)]
pub struct EventInfo {
    /// The log index of the command whose apply produced the events.
    pub event_index: Index,
    /// The session's previous event index.
    pub previous_index: Index,
}

/// Merges two streams into a single client-side linearization: operation
/// responses (ordered by their request sequence) and server-pushed events
/// (ordered by event index). The contract is that all events with an event
/// index at or below a response's event index fire before that response's
/// callback, matching the order in which the server produced them.
///
/// A response whose event index is ahead of the events seen so far is held
/// until the event stream catches up: either the missing events arrive and
/// fire, or an event from beyond the response's index proves the gap empty
/// (events arrive in order, so a later event's arrival means nothing earlier
/// is still in flight).
pub struct Sequencer {
    /// The request sequence number of the last sequenced request.
    request_sequence: u64,
    /// The request sequence number of the last completed response.
    response_sequence: u64,
    /// The event index of the last completed event batch.
    event_index: Index,
    /// Responses arrived but not yet completed, by request sequence.
    responses: HashMap<u64, (Option<ResponseInfo>, Callback)>,
    /// Event batches arrived but not yet completed, in arrival order.
    events: VecDeque<(EventInfo, Callback)>,
}

impl Sequencer {
    /// Creates a new sequencer.
    pub fn new() -> Self {
        Self {
            request_sequence: 0,
            response_sequence: 0,
            event_index: 0,
            responses: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Returns the next request sequence number. Every submitted operation
    /// takes one; its response is sequenced under it.
    pub fn next_request(&mut self) -> u64 {
        self.request_sequence += 1;
        self.request_sequence
    }

    /// Returns the event index of the last completed event batch.
    pub fn event_index(&self) -> Index {
        self.event_index
    }

    /// Sequences an event batch. With no requests in flight it fires
    /// immediately; otherwise it is queued and fires relative to pending
    /// responses.
    pub fn sequence_event(&mut self, event: EventInfo, callback: Callback) {
        if self.request_sequence == self.response_sequence {
            self.event_index = event.event_index;
            callback();
        } else {
            self.events.push_back((event, callback));
            self.complete_responses();
        }
    }

    /// Sequences an operation response under its request sequence number. A
    /// None response indicates a failed operation, sequenced purely by
    /// request order.
    pub fn sequence_response(
        &mut self,
        sequence: u64,
        response: Option<ResponseInfo>,
        callback: Callback,
    ) {
        self.responses.insert(sequence, (response, callback));
        self.complete_responses();
    }

    /// Completes as many responses as possible, in request order, firing
    /// pending events their event indexes require first.
    fn complete_responses(&mut self) {
        while let Some((response, _)) = self.responses.get(&(self.response_sequence + 1)) {
            if let Some(info) = response {
                if info.event_index > self.event_index && !self.complete_events(info.event_index)
                {
                    // Events below the response's index may still be in
                    // flight; hold the response until they resolve.
                    break;
                }
            }
            let (_, callback) = self
                .responses
                .remove(&(self.response_sequence + 1))
                .expect("checked above");
            self.response_sequence += 1;
            callback();
        }

        // With no requests left in flight, any remaining events fire freely.
        if self.request_sequence == self.response_sequence {
            while let Some((event, callback)) = self.events.pop_front() {
                self.event_index = event.event_index;
                callback();
            }
        }
    }

    /// Fires pending events up to the given event index. Returns true if the
    /// event stream is known to be complete through that index: either the
    /// events fired, or a queued later event proves the gap empty.
    fn complete_events(&mut self, through: Index) -> bool {
        while self.events.front().map(|(e, _)| e.event_index <= through).unwrap_or(false) {
            let (event, callback) = self.events.pop_front().expect("checked nonempty");
            self.event_index = event.event_index;
            callback();
        }
        self.event_index >= through || !self.events.is_empty()
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records callback firing order. Each callback pushes its label.
    #[derive(Clone, Default)]
    struct Order(Rc<RefCell<Vec<&'static str>>>);

    impl Order {
        fn record(&self, label: &'static str) -> Callback {
            let order = self.0.clone();
            Box::new(move || order.borrow_mut().push(label))
        }

        fn fired(&self) -> Vec<&'static str> {
            self.0.borrow().clone()
        }
    }

    fn event(event_index: Index, previous_index: Index) -> EventInfo {
        EventInfo { event_index, previous_index }
    }

    fn response(event_index: Index) -> Option<ResponseInfo> {
        Some(ResponseInfo { event_index })
    }

    #[test]
    // An event arriving before its command's response fires first.
    fn event_before_command() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        let sequence = sequencer.next_request();

        sequencer.sequence_event(event(1, 0), order.record("event"));
        sequencer.sequence_response(sequence, response(1), order.record("response"));
        assert_eq!(vec!["event", "response"], order.fired());
    }

    #[test]
    // A response arriving before its events is held until they fire.
    fn event_after_command() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        let sequence = sequencer.next_request();

        sequencer.sequence_response(sequence, response(1), order.record("response"));
        assert_eq!(Vec::<&str>::new(), order.fired());
        sequencer.sequence_event(event(1, 0), order.record("event"));
        assert_eq!(vec!["event", "response"], order.fired());
    }

    #[test]
    // An event at exactly the response's index still fires first.
    fn event_at_command() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        let sequence = sequencer.next_request();

        sequencer.sequence_response(sequence, response(2), order.record("response"));
        sequencer.sequence_event(event(2, 0), order.record("event"));
        assert_eq!(vec!["event", "response"], order.fired());
    }

    #[test]
    // Events beyond the response's event index fire after it, once all
    // requests have completed.
    fn event_after_all_commands() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        let sequence = sequencer.next_request();

        sequencer.sequence_event(event(2, 0), order.record("event1"));
        sequencer.sequence_event(event(3, 2), order.record("event2"));
        sequencer.sequence_response(sequence, response(2), order.record("response"));
        assert_eq!(vec!["event1", "response", "event2"], order.fired());
    }

    #[test]
    // With no requests in flight, events fire immediately.
    fn event_absent_command() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();

        sequencer.sequence_event(event(2, 0), order.record("event1"));
        sequencer.sequence_event(event(3, 2), order.record("event2"));
        assert_eq!(vec!["event1", "event2"], order.fired());
        assert_eq!(3, sequencer.event_index());
    }

    #[test]
    // Responses complete in request order regardless of arrival order.
    fn responses_in_request_order() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        let sequence1 = sequencer.next_request();
        let sequence2 = sequencer.next_request();
        assert_eq!(sequence2, sequence1 + 1);

        sequencer.sequence_response(sequence2, response(0), order.record("second"));
        assert_eq!(Vec::<&str>::new(), order.fired());
        sequencer.sequence_response(sequence1, response(0), order.record("first"));
        assert_eq!(vec!["first", "second"], order.fired());
    }

    #[test]
    // A response whose events never existed is released when a later event
    // proves the gap empty, and fires before that event.
    fn missing_event() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        sequencer.request_sequence = 2;
        sequencer.response_sequence = 1;
        sequencer.event_index = 5;

        sequencer.sequence_response(2, response(10), order.record("response"));
        assert_eq!(Vec::<&str>::new(), order.fired());

        // The event at 25 with previous index 5 proves nothing exists in
        // (5, 25), so the response (waiting through 10) fires, then the
        // event.
        sequencer.sequence_event(event(25, 5), order.record("event"));
        assert_eq!(vec!["response", "event"], order.fired());
    }

    #[test]
    // Multiple held responses release in order when a later event proves
    // their gaps empty.
    fn multiple_missing_events() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        sequencer.request_sequence = 3;
        sequencer.response_sequence = 1;
        sequencer.event_index = 5;

        sequencer.sequence_response(3, response(10), order.record("response2"));
        sequencer.sequence_response(2, response(8), order.record("response1"));
        assert_eq!(Vec::<&str>::new(), order.fired());

        sequencer.sequence_event(event(25, 5), order.record("event1"));
        assert_eq!(vec!["response1", "response2", "event1"], order.fired());

        sequencer.sequence_event(event(28, 25), order.record("event2"));
        assert_eq!(vec!["response1", "response2", "event1", "event2"], order.fired());
    }

    #[test]
    // Failed operations sequence by request order alone.
    fn error_response_sequences_in_order() {
        let order = Order::default();
        let mut sequencer = Sequencer::new();
        let sequence1 = sequencer.next_request();
        let sequence2 = sequencer.next_request();

        sequencer.sequence_response(sequence2, response(7), order.record("ok"));
        sequencer.sequence_response(sequence1, None, order.record("error"));
        // The error fires first (request order); the ok response waits for
        // event 7, which a fresh event releases.
        assert_eq!(vec!["error"], order.fired());
        sequencer.sequence_event(event(7, 0), order.record("event"));
        assert_eq!(vec!["error", "event", "ok"], order.fired());
    }
}
