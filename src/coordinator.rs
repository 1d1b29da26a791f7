//! C7: the crawl coordinator. Drains the DHT's announcement queue (C1),
//! gates concurrency with a semaphore, and runs the per-announcement
//! pipeline: blacklist/exists check → C5 fetch (with retry/backoff) →
//! parse → C4 scrape → store insert. One OS thread per unit of work,
//! spawned and released through the permit-gated worker body of §4.7.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::blacklist::Blacklist;
use crate::dht::Node;
use crate::error::CrawlError;
use crate::peer::wire::MetaWire;
use crate::queue::{Announcement, Peer};
use crate::store::{CatalogStore, CountPublisher};
use crate::sync::Semaphore;
use crate::torrent::Torrent;
use crate::tracker::Scraper;

pub struct CoordinatorConfig {
    pub max_peers: usize,
    pub max_retries: u32,
    pub fetch_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_peers: 400,
            max_retries: 3,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    semaphore: Semaphore,
    blacklist: Arc<Blacklist>,
    store: Arc<dyn CatalogStore>,
    scraper: Arc<Scraper>,
    publisher: Option<Arc<dyn CountPublisher>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn CatalogStore>,
        scraper: Arc<Scraper>,
        publisher: Option<Arc<dyn CountPublisher>>,
    ) -> Coordinator {
        let semaphore = Semaphore::new(config.max_peers);
        Coordinator {
            config,
            semaphore,
            blacklist: Arc::new(Blacklist::new(crate::blacklist::DEFAULT_TTL, crate::blacklist::DEFAULT_CAPACITY)),
            store,
            scraper,
            publisher,
        }
    }

    /// §4.7 main loop: wait for announcements, drain one at a time,
    /// acquiring a permit (the backpressure point) before spawning each
    /// worker. Returns when the DHT node signals `die`.
    ///
    /// Alongside the drain, polls `node.peer_count()` on the same cadence
    /// as `torsniff.run()`'s 5-second ticker and logs growth since the
    /// last tick (§4.6 "`peer_count()` ... for logging").
    pub fn run(&self, node: &Node) -> anyhow::Error {
        let peer_count_interval = Duration::from_secs(5);
        let mut next_peer_count_tick = Instant::now() + peer_count_interval;
        let mut last_peer_count = 0u64;

        loop {
            if let Ok(err) = node.die.try_recv() {
                return err;
            }
            node.announcements.wait(Duration::from_millis(500));
            while let Some(announcement) = node.announcements.try_pop() {
                let permit = self.semaphore.acquire();
                let blacklist = self.blacklist.clone();
                let store = self.store.clone();
                let scraper = self.scraper.clone();
                let publisher = self.publisher.clone();
                let max_retries = self.config.max_retries;
                let timeout = self.config.fetch_timeout;
                thread::spawn(move || {
                    run_worker(announcement, &blacklist, store.as_ref(), &scraper, publisher.as_deref(), max_retries, timeout);
                    drop(permit);
                });
            }

            if Instant::now() >= next_peer_count_tick {
                let count = node.peer_count();
                if count > last_peer_count {
                    log::info!("got {count} peers (+{})", count - last_peer_count);
                    last_peer_count = count;
                }
                next_peer_count_tick = Instant::now() + peer_count_interval;
            }
        }
    }
}

/// §4.7 worker routine. Runs entirely inside the caller's spawned thread;
/// the permit is released by the caller once this returns.
fn run_worker(
    announcement: Announcement,
    blacklist: &Blacklist,
    store: &dyn CatalogStore,
    scraper: &Scraper,
    publisher: Option<&dyn CountPublisher>,
    max_retries: u32,
    timeout: Duration,
) {
    let infohash_hex = announcement.infohash_hex();
    if store.exists(&infohash_hex) {
        return;
    }
    if blacklist.has(announcement.peer) {
        return;
    }

    let my_peer_id = random_peer_id();
    let meta = match fetch_with_retry(announcement.peer, announcement.infohash, my_peer_id, max_retries, timeout) {
        Some(bytes) => bytes,
        None => {
            blacklist.add(announcement.peer);
            return;
        }
    };

    let torrent = match Torrent::from_info_bytes(&meta, &infohash_hex) {
        Ok(t) => t,
        Err(err) => {
            log::warn!("failed to parse info dict from {}: {err}", announcement.peer);
            return;
        }
    };

    let (seeds, leechers) = scraper.scrape_all(&announcement.infohash);
    let torrent = torrent.with_scrape(seeds, leechers);

    match store.insert(&torrent, &meta) {
        Ok(()) => {
            log::info!("indexed {} ({})", torrent.name, torrent.infohash_hex);
            if let Some(publisher) = publisher {
                publisher.publish(store.count());
            }
        }
        Err(err) => log::warn!("store error for {infohash_hex}: {err}"),
    }
}

/// §4.7 step 3: up to `max_retries` attempts, each a fresh C5 connection,
/// backing off 2/4/8s between attempts. A non-retryable `CrawlError`
/// (protocol mismatch, unsupported extension, verification failure) still
/// exhausts its attempt but is just as likely to fail again; retryable vs.
/// non-retryable is only distinguished at the error-kind level (§7), so
/// every failure here uses the same backoff.
fn fetch_with_retry(
    peer: Peer,
    infohash: [u8; 20],
    my_peer_id: [u8; 20],
    max_retries: u32,
    timeout: Duration,
) -> Option<Vec<u8>> {
    for attempt in 1..=max_retries {
        match attempt_fetch(peer.0, infohash, my_peer_id, timeout) {
            Ok(bytes) => return Some(bytes),
            Err(err) => {
                log::debug!("metadata fetch from {peer} failed (attempt {attempt}/{max_retries}): {err}");
                if attempt < max_retries {
                    thread::sleep(Duration::from_secs(1 << attempt));
                }
            }
        }
    }
    None
}

fn attempt_fetch(peer: SocketAddr, infohash: [u8; 20], my_peer_id: [u8; 20], timeout: Duration) -> Result<Vec<u8>, CrawlError> {
    let wire = MetaWire::connect(peer, timeout)?;
    wire.fetch(&infohash, my_peer_id)
}

fn random_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// §8 invariant/scenario S6: a peer that always refuses TCP ends up
    /// blacklisted after `max_retries` attempts, and a later announcement
    /// for the same peer is skipped without another attempt.
    #[test]
    fn s6_retry_then_blacklist_then_skip() {
        let blacklist = Blacklist::new(Duration::from_secs(60), 10);
        let store = MemoryStore::new();
        let scraper = Scraper::empty();
        // Port 1 on loopback should refuse immediately.
        let peer = Peer(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1));
        let announcement = Announcement { infohash: [9; 20], peer };

        run_worker(announcement.clone(), &blacklist, &store, &scraper, None, 3, Duration::from_millis(200));
        assert!(blacklist.has(peer));

        // A second announcement for the same peer short-circuits on the
        // blacklist check before any connection is attempted again; the
        // entry simply stays present.
        run_worker(announcement, &blacklist, &store, &scraper, None, 3, Duration::from_millis(200));
        assert!(blacklist.has(peer));
    }

    /// §8 invariant 7 / scenario S7: the semaphore never lets more than
    /// `max_peers` workers run concurrently.
    #[test]
    fn s7_backpressure_never_exceeds_max_peers() {
        let sem = Semaphore::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let sem = sem.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(thread::spawn(move || {
                let _permit = sem.acquire();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
