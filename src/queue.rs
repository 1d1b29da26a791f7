//! C1: the announcement queue. A bounded FIFO decoupling the DHT's UDP read
//! loop (producer) from the crawl coordinator (consumer). `push` never
//! blocks: on overflow the oldest entry is evicted, because a slow
//! coordinator must never stall the UDP reader and cause it to miss
//! unrelated KRPC responses.
//!
//! `wait()` + `try_pop()` form the drain pattern mandated by §4.1: arm the
//! wait, then pop until empty before re-arming. We use a `Condvar` rather
//! than a channel so the producer side never blocks on a full consumer.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer(pub SocketAddr);

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Announcement {
    pub infohash: [u8; 20],
    pub peer: Peer,
}

impl Announcement {
    pub fn infohash_hex(&self) -> String {
        hex_encode(&self.infohash)
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

struct Inner {
    items: VecDeque<Announcement>,
}

pub struct AnnouncementQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl AnnouncementQueue {
    pub fn new(capacity: usize) -> Self {
        AnnouncementQueue {
            capacity,
            inner: Mutex::new(Inner { items: VecDeque::new() }),
            not_empty: Condvar::new(),
        }
    }

    /// Never blocks. Evicts the oldest item on overflow (newest wins).
    pub fn push(&self, item: Announcement) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
        }
        let was_empty = inner.items.is_empty();
        inner.items.push_back(item);
        drop(inner);
        if was_empty {
            self.not_empty.notify_one();
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<Announcement> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Blocks until the queue has gone from empty to non-empty (or the
    /// given timeout elapses). Spurious wakeups are allowed, so a
    /// caller must re-check with `try_pop` regardless of the return
    /// value). A bounded wait keeps the coordinator responsive to
    /// shutdown signals instead of blocking forever.
    pub fn wait(&self, timeout: Duration) {
        let inner = self.inner.lock().unwrap();
        if !inner.items.is_empty() {
            return;
        }
        let _ = self.not_empty.wait_timeout(inner, timeout).unwrap();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ann(n: u8) -> Announcement {
        Announcement {
            infohash: [n; 20],
            peer: Peer(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881)),
        }
    }

    #[test]
    fn push_pop_preserves_order() {
        let q = AnnouncementQueue::new(4);
        q.push(ann(1));
        q.push(ann(2));
        assert_eq!(q.try_pop().unwrap().infohash[0], 1);
        assert_eq!(q.try_pop().unwrap().infohash[0], 2);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let q = AnnouncementQueue::new(2);
        q.push(ann(1));
        q.push(ann(2));
        q.push(ann(3));
        assert_eq!(q.try_pop().unwrap().infohash[0], 2);
        assert_eq!(q.try_pop().unwrap().infohash[0], 3);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn every_item_popped_at_most_once() {
        let q = AnnouncementQueue::new(1000);
        for i in 0..100u8 {
            q.push(ann(i));
        }
        let mut seen = std::collections::HashSet::new();
        while let Some(a) = q.try_pop() {
            assert!(seen.insert(a.infohash[0]));
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn wait_returns_immediately_when_already_non_empty() {
        let q = AnnouncementQueue::new(4);
        q.push(ann(1));
        q.wait(Duration::from_millis(5));
        assert!(q.try_pop().is_some());
    }
}
