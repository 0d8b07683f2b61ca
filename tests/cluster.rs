//! End-to-end cluster tests: real servers over TCP on ephemeral ports, with
//! real client sessions.

use skiff::error::Result;
use skiff::raft::{Log, Member, MemberType, Server};
use skiff::session::Driver;
use skiff::storage::log::Memory;
use skiff::{ApplyContext, Client, Consistency, Options, StateMachine};

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An echo state machine: commands and queries return their own payload.
/// Commands starting with 0xee also publish the remaining bytes as an event
/// to the submitting session.
struct Echo;

impl StateMachine for Echo {
    fn apply(&mut self, ctx: &mut ApplyContext, command: &[u8]) -> Result<Vec<u8>> {
        if command.first() == Some(&0xee) {
            ctx.publish(command[1..].to_vec());
        }
        Ok(command.to_vec())
    }

    fn query(&self, query: &[u8]) -> Result<Vec<u8>> {
        Ok(query.to_vec())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Starts an n-node cluster on ephemeral ports, returning the client
/// addresses.
fn spawn_cluster(size: u8) -> Vec<String> {
    let mut peer_listeners = Vec::new();
    let mut client_listeners = Vec::new();
    let mut members = Vec::new();
    for id in 1..=size {
        let peer = TcpListener::bind("127.0.0.1:0").expect("bind peer listener");
        let client = TcpListener::bind("127.0.0.1:0").expect("bind client listener");
        members.push(Member {
            id,
            address: peer.local_addr().unwrap().to_string(),
            client_address: client.local_addr().unwrap().to_string(),
            member_type: MemberType::Active,
        });
        peer_listeners.push(peer);
        client_listeners.push(client);
    }

    let addresses = members.iter().map(|m| m.client_address.clone()).collect();
    for (i, (peer, client)) in
        peer_listeners.into_iter().zip(client_listeners.into_iter()).enumerate()
    {
        let id = i as u8 + 1;
        let log = Log::new(Box::new(Memory::new())).expect("log");
        let driver = Driver::new(Box::new(Echo));
        let server = Server::new(id, members.clone(), log, driver).expect("server");
        std::thread::spawn(move || {
            let _ = server.serve(peer, client);
        });
    }
    addresses
}

/// Waits for a condition, polling until the timeout.
fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn single_node_session() {
    let addresses = spawn_cluster(1);

    let events: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let options = Options {
        on_event: Some(Box::new(move |event| sink.lock().unwrap().push(event))),
        ..Options::default()
    };
    let client = Client::connect(addresses, options).expect("connect");
    assert!(client.session() > 0);

    // Commands echo their payload.
    assert_eq!(vec![0x01, 0x02], client.execute(vec![0x01, 0x02]).expect("execute"));

    // An event-producing command delivers its event before the response.
    assert_eq!(vec![0xee, 0x07], client.execute(vec![0xee, 0x07]).expect("execute"));
    assert_eq!(vec![vec![0x07]], events.lock().unwrap().clone());

    // Queries at both consistency levels.
    assert_eq!(
        vec![0xaa],
        client.query(vec![0xaa], Consistency::Linearizable).expect("linearizable query")
    );
    assert_eq!(
        vec![0xab],
        client.query(vec![0xab], Consistency::Sequential).expect("sequential query")
    );

    client.close().expect("close");
}

#[test]
fn single_node_pipelined_commands() {
    let addresses = spawn_cluster(1);
    let client = Client::connect(addresses, Options::default()).expect("connect");

    // Pipeline several commands; results arrive in submission order.
    let handles: Vec<_> =
        (1..=5u8).map(|n| client.submit(vec![n]).expect("submit")).collect();
    for (n, handle) in (1..=5u8).zip(handles) {
        assert_eq!(Ok(vec![n]), handle.recv().expect("result"));
    }

    client.close().expect("close");
}

#[test]
fn three_node_cluster_serves_sessions() {
    let addresses = spawn_cluster(3);

    // Registration retries internally until a leader is elected.
    let client = Client::connect(addresses, Options::default()).expect("connect");

    assert_eq!(vec![0x01], client.execute(vec![0x01]).expect("execute"));
    assert_eq!(vec![0x02], client.execute(vec![0x02]).expect("execute"));
    assert_eq!(
        vec![0xaa],
        client.query(vec![0xaa], Consistency::Linearizable).expect("query")
    );

    client.close().expect("close");
}

#[test]
fn events_delivered_in_order() {
    let addresses = spawn_cluster(1);

    let events: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let options = Options {
        on_event: Some(Box::new(move |event| sink.lock().unwrap().push(event))),
        ..Options::default()
    };
    let client = Client::connect(addresses, options).expect("connect");

    for n in 1..=5u8 {
        client.execute(vec![0xee, n]).expect("execute");
    }
    assert!(
        wait_for(Duration::from_secs(2), || events.lock().unwrap().len() == 5),
        "expected 5 events, got {:?}",
        events.lock().unwrap()
    );
    assert_eq!(
        vec![vec![1], vec![2], vec![3], vec![4], vec![5]],
        events.lock().unwrap().clone()
    );

    client.close().expect("close");
}
