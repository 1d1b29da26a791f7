//! §6 external interfaces: the catalog store and the live-count
//! notification channel are collaborators outside the core (§1); only
//! their interfaces live here. `MemoryStore` is a reference implementation
//! used by the coordinator's own tests; a real deployment backs
//! `CatalogStore` with the embedded SQL database named in spec §1.

use crate::torrent::Torrent;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Browse/search/delete/count are named in §6 as part of the query-surface
/// contract but are exercised by the HTTP/WebSocket layer (§1 Non-goal),
/// not by the crawl coordinator; they're still part of the trait so a real
/// store implementation has one place to satisfy both consumers.
pub trait CatalogStore: Send + Sync {
    /// Idempotent on `infohash_hex` (§6): a primary-key conflict is
    /// silently treated as success, never surfaced as `StoreError`.
    fn insert(&self, torrent: &Torrent, raw_meta: &[u8]) -> Result<(), StoreError>;
    fn exists(&self, infohash_hex: &str) -> bool;
    fn get_meta(&self, infohash_hex: &str) -> Option<Vec<u8>>;
    fn count(&self) -> u64;
    fn search(&self, query: &str) -> Vec<Torrent>;
    fn delete(&self, infohash_hex: &str) -> Result<(), StoreError>;
}

struct Entry {
    torrent: Torrent,
    raw_meta: Vec<u8>,
}

/// In-memory reference `CatalogStore`, used by the coordinator's tests
/// (§8 scenarios) in place of the external embedded SQL database.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { entries: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl CatalogStore for MemoryStore {
    fn insert(&self, torrent: &Torrent, raw_meta: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        // Idempotent on infohash_hex: an existing entry silently wins,
        // matching "primary-key conflict is silently ignored" (§6).
        entries
            .entry(torrent.infohash_hex.clone())
            .or_insert_with(|| Entry { torrent: torrent.clone(), raw_meta: raw_meta.to_vec() });
        Ok(())
    }

    fn exists(&self, infohash_hex: &str) -> bool {
        self.entries.lock().contains_key(infohash_hex)
    }

    fn get_meta(&self, infohash_hex: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(infohash_hex).map(|e| e.raw_meta.clone())
    }

    fn count(&self) -> u64 {
        self.entries.lock().len() as u64
    }

    fn search(&self, query: &str) -> Vec<Torrent> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.torrent.name.contains(query))
            .map(|e| e.torrent.clone())
            .collect()
    }

    fn delete(&self, infohash_hex: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(infohash_hex);
        Ok(())
    }
}

/// §6 "live-count notification": best-effort, drop-on-full delivery of the
/// new catalog total after every successful insert.
pub trait CountPublisher: Send + Sync {
    fn publish(&self, total: u64);
}

pub struct ChannelCountPublisher {
    sender: crossbeam::channel::Sender<u64>,
}

impl ChannelCountPublisher {
    /// Bounded at 1: a slow/absent WebSocket broadcaster never backs up
    /// the coordinator, and only the freshest count matters to a
    /// subscriber anyway.
    pub fn new() -> (Self, crossbeam::channel::Receiver<u64>) {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        (ChannelCountPublisher { sender }, receiver)
    }
}

impl CountPublisher for ChannelCountPublisher {
    fn publish(&self, total: u64) {
        let _ = self.sender.try_send(total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(hex: &str) -> Torrent {
        Torrent {
            infohash_hex: hex.to_string(),
            name: "t".to_string(),
            length: 1,
            files: vec![crate::torrent::TorrentFile { name: "t".to_string(), length: 1 }],
            seeds: 0,
            leechers: 0,
        }
    }

    #[test]
    fn insert_is_idempotent_on_infohash() {
        let store = MemoryStore::new();
        store.insert(&torrent("abc"), b"meta-1").unwrap();
        store.insert(&torrent("abc"), b"meta-2").unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.get_meta("abc"), Some(b"meta-1".to_vec()));
    }

    #[test]
    fn exists_reflects_inserted_entries() {
        let store = MemoryStore::new();
        assert!(!store.exists("abc"));
        store.insert(&torrent("abc"), b"meta").unwrap();
        assert!(store.exists("abc"));
    }

    #[test]
    fn count_publisher_drops_when_full() {
        let (publisher, receiver) = ChannelCountPublisher::new();
        publisher.publish(1);
        publisher.publish(2); // receiver hasn't drained yet; dropped, not blocked
        assert_eq!(receiver.try_recv().unwrap(), 1);
        assert!(receiver.try_recv().is_err());
    }
}
