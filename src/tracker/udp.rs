//! UDP scrape (BEP-15, §4.4): connect handshake followed by a scrape
//! request, both framed by hand with `byteorder` as raw big-endian byte
//! packing, since the UDP tracker wire format is fixed-width binary, not
//! bencode. One deadline covers the whole connect+scrape exchange (§4.4
//! "One deadline (≈ 15 s) covers the whole exchange").

use byteorder::{BigEndian, ByteOrder};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::error::CrawlError;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_SCRAPE: u32 = 2;
const TOKEN: Token = Token(0);

pub fn scrape(host: &str, port: u16, infohash: &[u8; 20], timeout: Duration) -> Result<(u32, u32), CrawlError> {
    let deadline = Instant::now() + timeout;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| io_error(e))?
        .next()
        .ok_or_else(|| protocol_error("could not resolve udp tracker address"))?;

    let mut socket = UdpSocket::bind("0.0.0.0:0".parse().unwrap()).map_err(io_error)?;
    let mut poll = Poll::new().map_err(io_error)?;
    poll.registry()
        .register(&mut socket, TOKEN, Interest::READABLE)
        .map_err(io_error)?;
    let mut events = Events::with_capacity(8);

    let connection_id = do_connect(&socket, &mut poll, &mut events, addr, deadline)?;
    do_scrape(&socket, &mut poll, &mut events, addr, connection_id, infohash, deadline)
}

fn do_connect(
    socket: &UdpSocket,
    poll: &mut Poll,
    events: &mut Events,
    addr: SocketAddr,
    deadline: Instant,
) -> Result<u64, CrawlError> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let mut packet = [0u8; 16];
    BigEndian::write_u64(&mut packet[0..8], PROTOCOL_ID);
    BigEndian::write_u32(&mut packet[8..12], ACTION_CONNECT);
    BigEndian::write_u32(&mut packet[12..16], transaction_id);
    socket.send_to(&packet, addr).map_err(io_error)?;

    let mut buf = [0u8; 16];
    let len = recv(socket, poll, events, &mut buf, deadline)?;
    if len < 16 {
        return Err(protocol_error("connect reply shorter than 16 bytes"));
    }
    let action = BigEndian::read_u32(&buf[0..4]);
    let reply_txn = BigEndian::read_u32(&buf[4..8]);
    if action != ACTION_CONNECT || reply_txn != transaction_id {
        return Err(protocol_error("connect reply action/transaction mismatch"));
    }
    Ok(BigEndian::read_u64(&buf[8..16]))
}

fn do_scrape(
    socket: &UdpSocket,
    poll: &mut Poll,
    events: &mut Events,
    addr: SocketAddr,
    connection_id: u64,
    infohash: &[u8; 20],
    deadline: Instant,
) -> Result<(u32, u32), CrawlError> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let mut packet = [0u8; 36];
    BigEndian::write_u64(&mut packet[0..8], connection_id);
    BigEndian::write_u32(&mut packet[8..12], ACTION_SCRAPE);
    BigEndian::write_u32(&mut packet[12..16], transaction_id);
    packet[16..36].copy_from_slice(infohash);
    socket.send_to(&packet, addr).map_err(io_error)?;

    let mut buf = [0u8; 20];
    let len = recv(socket, poll, events, &mut buf, deadline)?;
    if len < 20 {
        return Err(protocol_error("scrape reply shorter than 20 bytes"));
    }
    let action = BigEndian::read_u32(&buf[0..4]);
    let reply_txn = BigEndian::read_u32(&buf[4..8]);
    if action != ACTION_SCRAPE || reply_txn != transaction_id {
        return Err(protocol_error("scrape reply action/transaction mismatch"));
    }
    let seeders = BigEndian::read_u32(&buf[8..12]);
    let leechers = BigEndian::read_u32(&buf[12..16]);
    Ok((seeders, leechers))
}

fn recv(
    socket: &UdpSocket,
    poll: &mut Poll,
    events: &mut Events,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<usize, CrawlError> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(timeout_error());
        }
        poll.poll(events, Some(deadline - now)).map_err(io_error)?;
        match socket.recv_from(buf) {
            Ok((len, _src)) => return Ok(len),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(io_error(e)),
        }
    }
}

fn protocol_error(detail: &str) -> CrawlError {
    CrawlError::ProtocolMismatch { peer: dummy_peer(), detail: detail.to_string() }
}

fn io_error(source: std::io::Error) -> CrawlError {
    CrawlError::TransportError { peer: dummy_peer(), source }
}

fn timeout_error() -> CrawlError {
    CrawlError::Timeout { peer: dummy_peer() }
}

fn dummy_peer() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Scenario S4: mock UDP tracker server answers connect then scrape.
    #[test]
    fn scenario_s4_udp_scrape_roundtrip() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let infohash = [5u8; 20];

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, client) = server.recv_from(&mut buf).unwrap();
            let txn = BigEndian::read_u32(&buf[12..16]);
            let mut reply = [0u8; 16];
            BigEndian::write_u32(&mut reply[0..4], ACTION_CONNECT);
            BigEndian::write_u32(&mut reply[4..8], txn);
            BigEndian::write_u64(&mut reply[8..16], 0x1122334455667788);
            server.send_to(&reply, client).unwrap();

            let (_, client) = server.recv_from(&mut buf).unwrap();
            let txn = BigEndian::read_u32(&buf[12..16]);
            let mut reply = [0u8; 20];
            BigEndian::write_u32(&mut reply[0..4], ACTION_SCRAPE);
            BigEndian::write_u32(&mut reply[4..8], txn);
            BigEndian::write_u32(&mut reply[8..12], 42);
            BigEndian::write_u32(&mut reply[12..16], 7);
            server.send_to(&reply, client).unwrap();
        });

        let (host, port) = (server_addr.ip().to_string(), server_addr.port());
        let result = scrape(&host, port, &infohash, Duration::from_secs(5)).unwrap();
        assert_eq!(result, (42, 7));
        handle.join().unwrap();
    }
}
