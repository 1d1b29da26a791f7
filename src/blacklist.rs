//! C2: time-bounded set of peers that recently failed a metadata fetch.
//! Advisory only: a false negative just wastes one retry attempt, so the
//! TTL sweep is amortized into `has`/`add` rather than run on a separate
//! timer.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::queue::Peer;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CAPACITY: usize = 50_000;

struct Inner {
    entries: HashMap<Peer, Instant>,
    order: VecDeque<Peer>,
}

pub struct Blacklist {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Blacklist {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Blacklist {
            ttl,
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn sweep(inner: &mut Inner, ttl: Duration, capacity: usize) {
        let now = Instant::now();
        while let Some(front) = inner.order.front().copied() {
            let expired = inner
                .entries
                .get(&front)
                .map(|inserted| now.duration_since(*inserted) >= ttl)
                .unwrap_or(true);
            if expired {
                inner.order.pop_front();
                inner.entries.remove(&front);
            } else {
                break;
            }
        }
        while inner.order.len() > capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn has(&self, peer: Peer) -> bool {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner, self.ttl, self.capacity);
        inner.entries.contains_key(&peer)
    }

    pub fn add(&self, peer: Peer) {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner, self.ttl, self.capacity);
        if inner.entries.insert(peer, Instant::now()).is_none() {
            inner.order.push_back(peer);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn peer(port: u16) -> Peer {
        Peer(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), port))
    }

    #[test]
    fn add_then_has_within_ttl() {
        let bl = Blacklist::new(Duration::from_secs(60), 10);
        bl.add(peer(1));
        assert!(bl.has(peer(1)));
        assert!(!bl.has(peer(2)));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let bl = Blacklist::new(Duration::from_millis(10), 10);
        bl.add(peer(1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!bl.has(peer(1)));
        assert_eq!(bl.len(), 0);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let bl = Blacklist::new(Duration::from_secs(60), 2);
        bl.add(peer(1));
        bl.add(peer(2));
        bl.add(peer(3));
        assert!(!bl.has(peer(1)));
        assert!(bl.has(peer(2)));
        assert!(bl.has(peer(3)));
    }
}
