//! C6: the DHT sybil node. A single UDP socket, one self id regenerated at
//! startup, no persisted routing table. Every inbound query gets a reply
//! that looks useful (§4.6 "responding-id trick") so neighbors keep the
//! node in their tables; `get_peers`/`announce_peer` additionally surface
//! an [`Announcement`] into the shared queue. Driven by a single-socket
//! `mio::Poll` loop on a background thread, long-lived rather than
//! one-shot.

use crate::krpc::{self, Body, Message, NodeId, Query};
use crate::queue::{Announcement, AnnouncementQueue, Peer};
use crossbeam::channel::{self, Receiver, Sender};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const UDP_TOKEN: Token = Token(0);
const MAX_DATAGRAM: usize = 1472;

pub fn bootstrap_nodes() -> Vec<&'static str> {
    vec![
        "router.bittorrent.com:6881",
        "router.utorrent.com:6881",
        "dht.transmissionbt.com:6881",
    ]
}

pub struct Node {
    pub announcements: Arc<AnnouncementQueue>,
    peer_count: Arc<AtomicU64>,
    pub die: Receiver<anyhow::Error>,
}

struct Shared {
    self_id: NodeId,
    announcements: Arc<AnnouncementQueue>,
    peer_count: Arc<AtomicU64>,
    /// Addresses observed as the *source of an inbound query*, the only
    /// harvesting path per §9 (outbound `find_node` is fire-and-forget and
    /// its responses are not used to grow this list).
    known_peers: Mutex<VecDeque<SocketAddr>>,
}

const KNOWN_PEERS_CAP: usize = 4096;

impl Node {
    pub fn spawn(laddr: &str, max_friends: u32, queue_capacity: usize) -> anyhow::Result<Node> {
        let addr: SocketAddr = laddr.parse()?;
        let socket = UdpSocket::bind(addr)?;
        let self_id = krpc::random_node_id();
        let announcements = Arc::new(AnnouncementQueue::new(queue_capacity));
        let peer_count = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(Shared {
            self_id,
            announcements: announcements.clone(),
            peer_count: peer_count.clone(),
            known_peers: Mutex::new(VecDeque::new()),
        });

        let (die_tx, die_rx) = channel::bounded(1);

        spawn_read_loop(socket, shared.clone(), die_tx.clone());
        spawn_find_node_storm(shared, max_friends, die_tx);

        Ok(Node { announcements, peer_count, die: die_rx })
    }

    pub fn peer_count(&self) -> u64 {
        self.peer_count.load(Ordering::Relaxed)
    }
}

fn spawn_read_loop(mut socket: UdpSocket, shared: Arc<Shared>, die_tx: Sender<anyhow::Error>) {
    thread::spawn(move || {
        let result = (|| -> anyhow::Result<()> {
            let mut poll = Poll::new()?;
            poll.registry().register(&mut socket, UDP_TOKEN, Interest::READABLE)?;
            let mut events = Events::with_capacity(1024);
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                poll.poll(&mut events, None)?;
                for event in events.iter() {
                    if event.token() != UDP_TOKEN || !event.is_readable() {
                        continue;
                    }
                    loop {
                        match socket.recv_from(&mut buf) {
                            Ok((len, src)) => handle_datagram(&socket, &shared, &buf[..len], src),
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        })();
        if let Err(err) = result {
            let _ = die_tx.try_send(err);
        }
    });
}

fn handle_datagram(socket: &UdpSocket, shared: &Arc<Shared>, datagram: &[u8], src: SocketAddr) {
    let Some(message) = Message::decode(datagram) else { return };
    let Body::Query(query) = message.body else {
        // Fire-and-forget outbound find_node: we never check `t` against
        // a pending-transaction table, so responses/errors are dropped
        // silently per §4.6 "Transactions".
        return;
    };

    remember_peer(shared, src);

    let response = match &query {
        Query::Ping { id } => Message::only_id_response(krpc::neighbor_id(id)),
        Query::FindNode { id, .. } => Message::nodes_response(krpc::neighbor_id(id), None),
        Query::GetPeers { id, info_hash } => {
            enqueue(shared, *info_hash, src);
            Message::nodes_response(krpc::neighbor_id(id), Some(random_token()))
        }
        Query::AnnouncePeer { id, info_hash, port, implied_port, .. } => {
            let port = if *implied_port { src.port() } else { *port };
            let peer_addr = SocketAddr::new(src.ip(), port);
            enqueue(shared, *info_hash, peer_addr);
            Message::only_id_response(krpc::neighbor_id(id))
        }
    };

    let bytes = Message::encode_response(message.transaction_id, response);
    let _ = socket.send_to(&bytes, src);
}

fn enqueue(shared: &Arc<Shared>, infohash: NodeId, peer_addr: SocketAddr) {
    shared.announcements.push(Announcement { infohash, peer: Peer(peer_addr) });
}

fn remember_peer(shared: &Arc<Shared>, src: SocketAddr) {
    let mut known = shared.known_peers.lock();
    if !known.contains(&src) {
        if known.len() >= KNOWN_PEERS_CAP {
            known.pop_front();
        }
        known.push_back(src);
        shared.peer_count.fetch_add(1, Ordering::Relaxed);
    }
}

fn random_token() -> Vec<u8> {
    let mut token = [0u8; 4];
    rand::thread_rng().fill(&mut token);
    token.to_vec()
}

/// Background `find_node` storm: a token-bucket paced at `max_friends` per
/// second, targeting bootstrap nodes on startup and previously-observed
/// query sources afterward (§4.6 "Outbound traffic").
fn spawn_find_node_storm(shared: Arc<Shared>, max_friends: u32, die_tx: Sender<anyhow::Error>) {
    thread::spawn(move || {
        let result = (|| -> anyhow::Result<()> {
            let mut socket = UdpSocket::bind("0.0.0.0:0".parse()?)?;
            let mut poll = Poll::new()?;
            poll.registry().register(&mut socket, Token(1), Interest::WRITABLE)?;

            let bootstrap: Vec<SocketAddr> = bootstrap_nodes()
                .into_iter()
                .filter_map(|host| host.to_socket_addrs().ok().and_then(|mut it| it.next()))
                .collect();

            let rate = max_friends.max(1);
            let period = Duration::from_secs(1) / rate;
            let mut next_tick = Instant::now();

            loop {
                let target = next_target(&shared, &bootstrap);
                let target_id = krpc::random_node_id();
                let query = Query::FindNode { id: shared.self_id, target: target_id };
                let bytes = Message::encode_query(krpc::random_transaction_id(), &query);
                let _ = socket.send_to(&bytes, target);

                next_tick += period;
                let now = Instant::now();
                if next_tick > now {
                    thread::sleep(next_tick - now);
                } else {
                    next_tick = now;
                }
            }
        })();
        if let Err(err) = result {
            let _ = die_tx.try_send(err);
        }
    });
}

fn next_target(shared: &Arc<Shared>, bootstrap: &[SocketAddr]) -> SocketAddr {
    let known = shared.known_peers.lock();
    if !known.is_empty() && rand::thread_rng().gen_bool(0.8) {
        let idx = rand::thread_rng().gen_range(0..known.len());
        return known[idx];
    }
    drop(known);
    let idx = rand::thread_rng().gen_range(0..bootstrap.len().max(1));
    bootstrap.get(idx).copied().unwrap_or_else(|| {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(67, 215, 246, 10)), 6881)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn handle_get_peers_enqueues_announcement() {
        let shared = Arc::new(Shared {
            self_id: [1; 20],
            announcements: Arc::new(AnnouncementQueue::new(16)),
            peer_count: Arc::new(AtomicU64::new(0)),
            known_peers: Mutex::new(VecDeque::new()),
        });
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881);
        let query = Query::GetPeers { id: [2; 20], info_hash: [9; 20] };
        let datagram = Message::encode_query(b"ab".to_vec(), &query);

        handle_datagram(&socket, &shared, &datagram, src);

        let ann = shared.announcements.try_pop().expect("announcement enqueued");
        assert_eq!(ann.infohash, [9; 20]);
        assert_eq!(ann.peer.0, src);
    }

    #[test]
    fn announce_peer_uses_implied_port() {
        let shared = Arc::new(Shared {
            self_id: [1; 20],
            announcements: Arc::new(AnnouncementQueue::new(16)),
            peer_count: Arc::new(AtomicU64::new(0)),
            known_peers: Mutex::new(VecDeque::new()),
        });
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 55123);
        let query = Query::AnnouncePeer {
            id: [2; 20],
            info_hash: [3; 20],
            port: 9999,
            implied_port: true,
            token: vec![1, 2],
        };
        let datagram = Message::encode_query(b"cd".to_vec(), &query);

        handle_datagram(&socket, &shared, &datagram, src);

        let ann = shared.announcements.try_pop().unwrap();
        assert_eq!(ann.peer.0.port(), 55123);
    }

    #[test]
    fn malformed_datagram_is_ignored() {
        let shared = Arc::new(Shared {
            self_id: [1; 20],
            announcements: Arc::new(AnnouncementQueue::new(16)),
            peer_count: Arc::new(AtomicU64::new(0)),
            known_peers: Mutex::new(VecDeque::new()),
        });
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 6881);
        handle_datagram(&socket, &shared, b"garbage", src);
        assert!(shared.announcements.try_pop().is_none());
    }
}
