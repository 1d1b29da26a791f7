//! C4: the tracker scraper. `Scraper` owns the shared tracker list behind a
//! `parking_lot::RwLock`, refreshed every 24h from the ngosang
//! `trackers_best.txt` feed (§6); a failed refresh just keeps the previous
//! list (§4.4). `scrape_all` fans a single infohash out to every tracker
//! and reduces to the per-field maximum, downgrading any per-tracker
//! failure to "skip this tracker" rather than failing the whole call.

pub mod http;
pub mod udp;

use parking_lot::RwLock;
use std::time::Duration;
use url::Url;

const TRACKER_LIST_URL: &str =
    "https://raw.githubusercontent.com/ngosang/trackerslist/master/trackers_best.txt";
const REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerUrl {
    Http(Url),
    /// §9 open question: the source hands a raw `udp://host:port/announce`
    /// string to an address resolver; we parse host/port up front instead.
    Udp { host: String, port: u16 },
}

impl TrackerUrl {
    /// Parses one line of the tracker list. Blank lines and anything that
    /// isn't a recognized scheme are skipped rather than failing the
    /// whole refresh.
    pub fn parse(line: &str) -> Option<TrackerUrl> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let url = Url::parse(line).ok()?;
        match url.scheme() {
            "http" | "https" => Some(TrackerUrl::Http(url)),
            "udp" => {
                let host = url.host_str()?.to_string();
                let port = url.port().unwrap_or(80);
                Some(TrackerUrl::Udp { host, port })
            }
            _ => None,
        }
    }
}

pub struct Scraper {
    urls: RwLock<Vec<TrackerUrl>>,
}

impl Scraper {
    pub fn new(urls: Vec<TrackerUrl>) -> Self {
        Scraper { urls: RwLock::new(urls) }
    }

    pub fn empty() -> Self {
        Scraper::new(Vec::new())
    }

    pub fn tracker_count(&self) -> usize {
        self.urls.read().len()
    }

    /// §4.4: per-tracker failures are logged and skipped; the aggregate is
    /// the per-tracker maximum of seeders and of leechers independently.
    /// Returns `(0, 0)` if every tracker fails or the list is empty.
    pub fn scrape_all(&self, infohash: &[u8; 20]) -> (u32, u32) {
        let urls = self.urls.read().clone();
        let mut max_seeds = 0u32;
        let mut max_leechers = 0u32;
        for url in &urls {
            let result = match url {
                TrackerUrl::Http(u) => http::scrape(u, infohash, SCRAPE_TIMEOUT),
                TrackerUrl::Udp { host, port } => udp::scrape(host, *port, infohash, SCRAPE_TIMEOUT),
            };
            match result {
                Ok((seeds, leechers)) => {
                    max_seeds = max_seeds.max(seeds);
                    max_leechers = max_leechers.max(leechers);
                }
                Err(err) => {
                    log::debug!("tracker {url:?} scrape failed: {err}");
                }
            }
        }
        (max_seeds, max_leechers)
    }

    /// Fetches the tracker list over HTTPS and replaces the current list.
    /// A failed fetch or an empty/unparseable body leaves the previous
    /// list in place (§4.4, §6 "failure to refresh leaves the previous
    /// list in place").
    pub fn refresh(&self) {
        match fetch_tracker_list(TRACKER_LIST_URL) {
            Ok(urls) if !urls.is_empty() => {
                log::info!("tracker list refreshed: {} trackers", urls.len());
                *self.urls.write() = urls;
            }
            Ok(_) => log::warn!("tracker list refresh returned no usable trackers, keeping old list"),
            Err(err) => log::warn!("tracker list refresh failed, keeping old list: {err}"),
        }
    }

    /// Spawns the 24h refresh tick (§5: "the scheduler writes it on a
    /// 24-hour tick, all other access is read").
    pub fn spawn_refresh_loop(self: std::sync::Arc<Self>) {
        std::thread::spawn(move || loop {
            self.refresh();
            std::thread::sleep(REFRESH_INTERVAL);
        });
    }
}

fn fetch_tracker_list(url: &str) -> anyhow::Result<Vec<TrackerUrl>> {
    let body = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?
        .get(url)
        .send()?
        .error_for_status()?
        .text()?;
    Ok(body.lines().filter_map(TrackerUrl::parse).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_and_udp_lines() {
        assert_eq!(
            TrackerUrl::parse("udp://tracker.example.com:1337/announce"),
            Some(TrackerUrl::Udp { host: "tracker.example.com".into(), port: 1337 })
        );
        assert!(matches!(
            TrackerUrl::parse("http://tracker.example.com/announce"),
            Some(TrackerUrl::Http(_))
        ));
        assert_eq!(TrackerUrl::parse(""), None);
        assert_eq!(TrackerUrl::parse("   "), None);
    }

    #[test]
    fn ignores_unrecognized_scheme() {
        assert_eq!(TrackerUrl::parse("ws://example.com"), None);
    }

    #[test]
    fn scrape_all_on_empty_list_is_zero_zero() {
        let scraper = Scraper::empty();
        assert_eq!(scraper.scrape_all(&[1; 20]), (0, 0));
    }
}
