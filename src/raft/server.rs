use super::{Address, Envelope, Log, Member, Message, Node, NodeID, TICK_INTERVAL};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::protocol::{ClientFrame, Request, ServerFrame};
use crate::session::{Driver, SessionId};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// The delay before reconnecting to an unreachable peer.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Events from client connection threads into the server event loop.
enum ClientEvent {
    /// A client connected; frames are sent back through the channel.
    Connected { conn: u64, tx: Sender<ServerFrame> },
    /// A client sent a request frame.
    Request { conn: u64, frame: ClientFrame },
    /// A client disconnected.
    Disconnected { conn: u64 },
}

/// A server, wrapping a consensus node and serving its network I/O: peer
/// traffic on one listener, client sessions on another. All node state is
/// owned by the event loop thread; connection threads only move messages.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    peers: HashMap<NodeID, String>,
}

impl Server {
    /// Creates a new server for the given cluster member.
    pub fn new(id: NodeID, members: Vec<Member>, log: Log, driver: Driver) -> Result<Self> {
        let (node_tx, node_rx) = channel::unbounded();
        let peers = members
            .iter()
            .filter(|m| m.id != id)
            .map(|m| (m.id, m.address.clone()))
            .collect();
        let clock = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Ok(Self { node: Node::new(id, members, log, driver, node_tx, clock)?, node_rx, peers })
    }

    /// Serves peer and client traffic until halted by a fatal error. Peer
    /// traffic uses the peer listener, client sessions the client listener.
    pub fn serve(self, peer_listener: TcpListener, client_listener: TcpListener) -> Result<()> {
        info!(
            "Serving peers on {} and clients on {}",
            peer_listener.local_addr()?,
            client_listener.local_addr()?
        );
        let (peer_in_tx, peer_in_rx) = channel::unbounded::<Envelope>();
        let (client_tx, client_rx) = channel::unbounded::<ClientEvent>();

        // Outbound peer channels, with a sender thread per peer that
        // continuously reconnects.
        let mut peer_txs: HashMap<NodeID, Sender<Envelope>> = HashMap::new();
        for (id, address) in self.peers.clone() {
            let (tx, rx) = channel::unbounded::<Envelope>();
            peer_txs.insert(id, tx);
            std::thread::spawn(move || Self::send_peer(address, rx));
        }

        // Inbound peer acceptor.
        std::thread::spawn(move || {
            if let Err(err) = Self::accept_peers(peer_listener, peer_in_tx) {
                error!("Peer listener failed: {err}");
            }
        });

        // Client acceptor.
        std::thread::spawn(move || {
            if let Err(err) = Self::accept_clients(client_listener, client_tx) {
                error!("Client listener failed: {err}");
            }
        });

        Self::eventloop(self.node, self.node_rx, peer_in_rx, client_rx, peer_txs)
    }

    /// The server event loop: drives the node by ticks and inbound messages,
    /// and routes its outbound messages to peers and clients.
    fn eventloop(
        mut node: Node,
        node_rx: Receiver<Envelope>,
        peer_rx: Receiver<Envelope>,
        client_rx: Receiver<ClientEvent>,
        peer_txs: HashMap<NodeID, Sender<Envelope>>,
    ) -> Result<()> {
        let ticker = channel::tick(TICK_INTERVAL);
        let node_id = node.id();
        // Client connections, and the node-level request id for each
        // in-flight client frame.
        let mut connections: HashMap<u64, Sender<ServerFrame>> = HashMap::new();
        let mut requests: HashMap<Vec<u8>, (u64, u64)> = HashMap::new();
        // Session → connection bindings for event delivery.
        let mut sessions: HashMap<SessionId, u64> = HashMap::new();

        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(peer_rx) -> msg => {
                    let msg = msg?;
                    node = node.step(msg)?;
                }

                recv(client_rx) -> event => match event? {
                    ClientEvent::Connected { conn, tx } => {
                        connections.insert(conn, tx);
                    }
                    ClientEvent::Disconnected { conn } => {
                        connections.remove(&conn);
                        sessions.retain(|_, c| *c != conn);
                        requests.retain(|_, (c, _)| *c != conn);
                    }
                    ClientEvent::Request { conn, frame } => {
                        if let Request::Connect(connect) = &frame.request {
                            if connect.session > 0 {
                                sessions.insert(connect.session, conn);
                            }
                        }
                        let id = uuid::Uuid::new_v4().as_bytes().to_vec();
                        requests.insert(id.clone(), (conn, frame.id));
                        node = node.step(Envelope {
                            from: Address::Client,
                            to: Address::Node(node_id),
                            term: 0,
                            message: Message::ClientRequest { id, request: frame.request },
                        })?;
                    }
                },

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    match msg.to {
                        Address::Node(to) => match peer_txs.get(&to) {
                            Some(tx) => tx.send(msg)?,
                            None => error!("No connection to peer {to}"),
                        },
                        Address::Broadcast => {
                            for tx in peer_txs.values() {
                                tx.send(msg.clone())?;
                            }
                        }
                        Address::Client => match msg.message {
                            Message::ClientResponse { id, response } => {
                                if let Some((conn, frame_id)) = requests.remove(&id) {
                                    if let Some(tx) = connections.get(&conn) {
                                        // A disconnect races the response.
                                        let _ = tx.send(ServerFrame::Response {
                                            id: frame_id,
                                            response,
                                        });
                                    }
                                }
                            }
                            Message::Publish(publish) => {
                                if let Some(conn) = sessions.get(&publish.session) {
                                    if let Some(tx) = connections.get(conn) {
                                        let _ = tx.send(ServerFrame::Publish(publish));
                                    }
                                }
                            }
                            message => {
                                return Err(Error::Internal(format!(
                                    "unexpected client message {message:?}"
                                )))
                            }
                        },
                    }
                }
            }
        }
    }

    /// Accepts inbound peer connections, spawning a receiver thread per
    /// connection.
    fn accept_peers(listener: TcpListener, in_tx: Sender<Envelope>) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept()?;
            let in_tx = in_tx.clone();
            std::thread::spawn(move || {
                debug!("Peer {peer} connected");
                match Self::receive_peer(socket, in_tx) {
                    Ok(()) => debug!("Peer {peer} disconnected"),
                    Err(err) => error!("Peer {peer} error: {err}"),
                }
            });
        }
    }

    /// Receives envelopes from a peer connection.
    fn receive_peer(socket: TcpStream, in_tx: Sender<Envelope>) -> Result<()> {
        let mut reader = std::io::BufReader::new(socket);
        while let Some(envelope) = Envelope::maybe_decode_from(&mut reader)? {
            in_tx.send(envelope)?;
        }
        Ok(())
    }

    /// Sends outbound envelopes to a peer, continuously reconnecting.
    fn send_peer(address: String, rx: Receiver<Envelope>) {
        loop {
            match TcpStream::connect(&address) {
                Ok(socket) => {
                    debug!("Connected to peer {address}");
                    if let Err(err) = Self::send_peer_session(socket, &rx) {
                        error!("Failed sending to peer {address}: {err}");
                    }
                }
                Err(err) => {
                    debug!("Failed connecting to peer {address}: {err}");
                    // Discard queued messages while unreachable, so stale
                    // traffic doesn't flood the peer on reconnect.
                    while rx.try_recv().is_ok() {}
                }
            }
            std::thread::sleep(RECONNECT_DELAY);
        }
    }

    /// Sends outbound envelopes over an established peer connection.
    fn send_peer_session(socket: TcpStream, rx: &Receiver<Envelope>) -> Result<()> {
        let mut writer = std::io::BufWriter::new(socket);
        for envelope in rx {
            envelope.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Accepts inbound client connections, spawning reader and writer
    /// threads per connection.
    fn accept_clients(listener: TcpListener, client_tx: Sender<ClientEvent>) -> Result<()> {
        let mut next_conn: u64 = 0;
        loop {
            let (socket, peer) = listener.accept()?;
            next_conn += 1;
            let conn = next_conn;
            let client_tx = client_tx.clone();
            std::thread::spawn(move || {
                debug!("Client {peer} connected as connection {conn}");
                match Self::serve_client(conn, socket, &client_tx) {
                    Ok(()) => debug!("Client {peer} disconnected"),
                    Err(err) => error!("Client {peer} error: {err}"),
                }
                let _ = client_tx.send(ClientEvent::Disconnected { conn });
            });
        }
    }

    /// Serves a single client connection: a writer thread drains outbound
    /// frames while this thread decodes inbound request frames.
    fn serve_client(conn: u64, socket: TcpStream, client_tx: &Sender<ClientEvent>) -> Result<()> {
        let (tx, rx) = channel::unbounded::<ServerFrame>();
        client_tx.send(ClientEvent::Connected { conn, tx })?;

        let writer_socket = socket.try_clone()?;
        std::thread::spawn(move || {
            let mut writer = std::io::BufWriter::new(writer_socket);
            for frame in rx {
                if frame.encode_into(&mut writer).and_then(|()| Ok(writer.flush()?)).is_err() {
                    break;
                }
            }
        });

        let mut reader = std::io::BufReader::new(socket);
        while let Some(frame) = ClientFrame::maybe_decode_from(&mut reader)? {
            client_tx.send(ClientEvent::Request { conn, frame })?;
        }
        Ok(())
    }
}
