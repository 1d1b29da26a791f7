//! HTTP scrape (§4.4): rewrite `/announce` to `/scrape` in the path,
//! percent-encode the raw infohash into the query string, GET with a short
//! deadline, and decode the bencoded body. Built the same way the
//! teacher's `tracker::http::scrape` drives a one-shot request over a
//! single-socket `mio::Poll` loop, but reading the response through
//! `httparse` instead of a hand-rolled `\r\n\r\n` search, and decoding the
//! body with our own `bencode::Value` instead of `serde_bencode`.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};
use url::Url;

use crate::bencode::Value;
use crate::error::CrawlError;

const TOKEN: Token = Token(0);

pub fn scrape(announce_url: &Url, infohash: &[u8; 20], timeout: Duration) -> Result<(u32, u32), CrawlError> {
    let deadline = Instant::now() + timeout;
    let host = announce_url
        .host_str()
        .ok_or_else(|| protocol_error(announce_url, "tracker url has no host"))?;
    let port = announce_url.port_or_known_default().unwrap_or(80);

    let mut scrape_path = announce_url.path().to_string();
    if let Some(pos) = scrape_path.find("/announce") {
        scrape_path.replace_range(pos..pos + "/announce".len(), "/scrape");
    }
    let query = format!("info_hash={}", urlencoding::encode_binary(infohash));
    let request = format!(
        "GET {scrape_path}?{query} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nUser-Agent: bitlurker\r\n\r\n"
    );

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| io_error(announce_url, e))?
        .next()
        .ok_or_else(|| protocol_error(announce_url, "could not resolve tracker address"))?;

    let mut stream = TcpStream::connect(addr).map_err(|e| io_error(announce_url, e))?;
    let mut poll = Poll::new().map_err(|e| io_error(announce_url, e))?;
    poll.registry()
        .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)
        .map_err(|e| io_error(announce_url, e))?;
    let mut events = Events::with_capacity(16);

    write_all(&mut stream, &mut poll, &mut events, request.as_bytes(), deadline, announce_url)?;

    let mut response = Vec::new();
    read_to_end(&mut stream, &mut poll, &mut events, &mut response, deadline, announce_url)?;

    let body = split_http_body(&response)
        .ok_or_else(|| protocol_error(announce_url, "malformed http response"))?;
    parse_scrape_body(body, infohash, announce_url)
}

fn split_http_body(raw: &[u8]) -> Option<&[u8]> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(raw).ok()? {
        httparse::Status::Complete(offset) => {
            if !matches!(response.code, Some(200)) {
                return None;
            }
            Some(&raw[offset..])
        }
        httparse::Status::Partial => None,
    }
}

fn parse_scrape_body(body: &[u8], infohash: &[u8; 20], url: &Url) -> Result<(u32, u32), CrawlError> {
    let value = Value::decode(body).map_err(|e| protocol_error(url, &format!("bad bencode body: {e}")))?;
    let files = value.get("files").ok_or_else(|| protocol_error(url, "no files key"))?;
    let entry = files
        .as_dict()
        .and_then(|d| d.get(infohash.as_slice()))
        .ok_or_else(|| protocol_error(url, "infohash missing from scrape response"))?;
    let complete = entry.get("complete").and_then(Value::as_int).unwrap_or(0).max(0) as u32;
    let incomplete = entry.get("incomplete").and_then(Value::as_int).unwrap_or(0).max(0) as u32;
    Ok((complete, incomplete))
}

fn write_all(
    stream: &mut TcpStream,
    poll: &mut Poll,
    events: &mut Events,
    buf: &[u8],
    deadline: Instant,
    url: &Url,
) -> Result<(), CrawlError> {
    let mut written = 0;
    while written < buf.len() {
        let remaining = remaining(deadline, url)?;
        poll.poll(events, Some(remaining)).map_err(|e| io_error(url, e))?;
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(protocol_error(url, "connection closed mid-write")),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(io_error(url, e)),
        }
    }
    Ok(())
}

fn read_to_end(
    stream: &mut TcpStream,
    poll: &mut Poll,
    events: &mut Events,
    out: &mut Vec<u8>,
    deadline: Instant,
    url: &Url,
) -> Result<(), CrawlError> {
    let mut buf = [0u8; 4096];
    loop {
        let remaining = remaining(deadline, url)?;
        poll.poll(events, Some(remaining)).map_err(|e| io_error(url, e))?;
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(io_error(url, e)),
        }
    }
}

fn remaining(deadline: Instant, url: &Url) -> Result<Duration, CrawlError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(timeout_error(url));
    }
    Ok(deadline - now)
}

fn protocol_error(url: &Url, detail: &str) -> CrawlError {
    CrawlError::ProtocolMismatch { peer: dummy_peer(), detail: format!("{url}: {detail}") }
}

fn io_error(url: &Url, source: std::io::Error) -> CrawlError {
    CrawlError::TransportError { peer: dummy_peer(), source: io_with_context(url, source) }
}

fn timeout_error(url: &Url) -> CrawlError {
    log::debug!("tracker timeout: {url}");
    CrawlError::Timeout { peer: dummy_peer() }
}

fn io_with_context(url: &Url, source: std::io::Error) -> std::io::Error {
    std::io::Error::new(source.kind(), format!("{url}: {source}"))
}

/// `CrawlError`'s transport/protocol variants carry a `SocketAddr`, which a
/// tracker URL (a hostname, not necessarily a resolved address) doesn't
/// cleanly have; scrape errors are always downgraded to "skip this
/// tracker" by the caller, so the peer field is never surfaced.
fn dummy_peer() -> std::net::SocketAddr {
    std::net::SocketAddr::from(([0, 0, 0, 0], 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scrape_body_reads_complete_and_incomplete() {
        let infohash = [7u8; 20];
        let mut body = Vec::new();
        body.extend_from_slice(b"d5:filesd");
        body.extend_from_slice(format!("{}:", infohash.len()).as_bytes());
        body.extend_from_slice(&infohash);
        body.extend_from_slice(b"d8:completei42e10:incompletei7eeee");
        let url = Url::parse("http://example.com/announce").unwrap();
        let (seeds, leechers) = parse_scrape_body(&body, &infohash, &url).unwrap();
        assert_eq!((seeds, leechers), (42, 7));
    }

    #[test]
    fn parse_scrape_body_missing_infohash_is_error() {
        let infohash = [7u8; 20];
        let body = b"d5:filesdee";
        let url = Url::parse("http://example.com/announce").unwrap();
        assert!(parse_scrape_body(body, &infohash, &url).is_err());
    }

    #[test]
    fn split_http_body_rejects_non_200() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        assert!(split_http_body(raw).is_none());
    }

    #[test]
    fn split_http_body_returns_tail_after_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc";
        assert_eq!(split_http_body(raw), Some(&b"abc"[..]));
    }
}
