//! C5: the BEP-10/BEP-9 metadata exchange. One TCP connection per fetch
//! attempt, driven by a single-socket `mio::Poll` loop that re-registers
//! read/write interest as the state machine advances through the BEP-10
//! extension handshake and the `ut_metadata` control protocol in §4.5.
//!
//! State machine: `Connecting -> HandshakeSent -> HandshakeOk ->
//! ExtHandshakeSent -> Fetching(i) -> Done | Failed`. Every forward
//! transition is driven by this module; any I/O error or deadline expiry
//! routes straight to `Failed` and the socket is dropped at the end of the
//! call that detected it, never deferred to function exit.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use sha1::{Digest, Sha1};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::bencode::Value;
use crate::error::CrawlError;
use crate::peer::handshake::Handshake;

const TOKEN: Token = Token(0);
const EXTENDED_MSG_ID: u8 = 20;
const EXT_HANDSHAKE_ID: u8 = 0;
/// The id we advertise for `ut_metadata` in our own extension handshake;
/// the remote addresses messages to us using this id (BEP-10: each side's
/// handshake dict assigns the id *others* must use to reach it).
const LOCAL_UT_METADATA_ID: i64 = 1;
const PIECE_LEN: usize = 16 * 1024;
const SOFT_CAP_BYTES: i64 = 10 * 1024 * 1024;
const MAX_FRAME_LEN: u32 = (SOFT_CAP_BYTES as u32) + 4096;

pub struct MetaWire {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    peer: SocketAddr,
    deadline: Instant,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Connecting,
    HandshakeSent,
    HandshakeOk,
    ExtHandshakeSent,
    Fetching(usize),
    Done,
    Failed,
}

impl MetaWire {
    pub fn connect(peer: SocketAddr, timeout: Duration) -> Result<MetaWire, CrawlError> {
        let deadline = Instant::now() + timeout;
        let mut stream = TcpStream::connect(peer)
            .map_err(|e| CrawlError::TransportError { peer, source: e })?;
        let poll = Poll::new().map_err(|e| CrawlError::TransportError { peer, source: e })?;
        poll.registry()
            .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(|e| CrawlError::TransportError { peer, source: e })?;
        Ok(MetaWire { stream, poll, events: Events::with_capacity(16), peer, deadline })
    }

    /// Runs the whole state machine and returns the verified `info` bytes.
    /// §8 invariant 4: on `Ok`, `sha1(bytes) == infohash` always holds.
    pub fn fetch(mut self, infohash: &[u8; 20], my_peer_id: [u8; 20]) -> Result<Vec<u8>, CrawlError> {
        let mut state = State::Connecting;

        state = self.do_handshake(state, infohash, my_peer_id)?;
        let (remote_ut_metadata, metadata_size) = self.do_extension_handshake(&mut state)?;

        let num_pieces = metadata_size.div_ceil(PIECE_LEN);
        let mut buffer = Vec::with_capacity(metadata_size);
        for index in 0..num_pieces {
            state = State::Fetching(index);
            let piece = self.fetch_piece(index, remote_ut_metadata)?;
            buffer.extend_from_slice(&piece);
        }
        let _ = state;

        if buffer.len() != metadata_size {
            return Err(CrawlError::ProtocolMismatch {
                peer: self.peer,
                detail: format!("assembled {} bytes, expected {}", buffer.len(), metadata_size),
            });
        }

        let mut hasher = Sha1::new();
        hasher.update(&buffer);
        let digest: [u8; 20] = hasher.finalize().into();
        if &digest != infohash {
            return Err(CrawlError::VerificationFailed { peer: self.peer });
        }

        Ok(buffer)
    }

    fn do_handshake(
        &mut self,
        _state: State,
        infohash: &[u8; 20],
        my_peer_id: [u8; 20],
    ) -> Result<State, CrawlError> {
        let handshake = Handshake::new(*infohash, my_peer_id);
        self.write_all(&handshake.to_bytes())?;

        let mut buf = [0u8; 68];
        self.read_exact(&mut buf)?;
        let reply = Handshake::from_bytes(&buf).map_err(|e| CrawlError::ProtocolMismatch {
            peer: self.peer,
            detail: e.to_string(),
        })?;
        if !reply.check(infohash) {
            return Err(CrawlError::ProtocolMismatch {
                peer: self.peer,
                detail: "handshake infohash mismatch".to_string(),
            });
        }
        if !reply.supports_extensions() {
            return Err(CrawlError::ExtensionUnsupported { peer: self.peer });
        }
        Ok(State::HandshakeOk)
    }

    fn do_extension_handshake(&mut self, state: &mut State) -> Result<(i64, usize), CrawlError> {
        let payload = Value::dict()
            .set(
                "m",
                Value::dict().set("ut_metadata", Value::Int(LOCAL_UT_METADATA_ID)).build(),
            )
            .build()
            .encode();
        let mut frame = vec![EXTENDED_MSG_ID, EXT_HANDSHAKE_ID];
        frame.extend_from_slice(&payload);
        self.write_frame(&frame)?;
        *state = State::ExtHandshakeSent;

        loop {
            let Some(frame) = self.read_frame()? else { continue }; // keep-alive
            if frame.len() < 2 || frame[0] != EXTENDED_MSG_ID || frame[1] != EXT_HANDSHAKE_ID {
                continue; // not our reply; ignore per §4.5 step 2/3
            }
            let dict = Value::decode(&frame[2..]).map_err(|e| CrawlError::ProtocolMismatch {
                peer: self.peer,
                detail: e.to_string(),
            })?;
            let remote_ut_metadata = dict
                .get("m")
                .and_then(|m| m.get("ut_metadata"))
                .and_then(Value::as_int)
                .ok_or_else(|| CrawlError::ExtensionUnsupported { peer: self.peer })?;
            let metadata_size = dict.get("metadata_size").and_then(Value::as_int).unwrap_or(0);
            if metadata_size <= 0 {
                return Err(CrawlError::ProtocolMismatch {
                    peer: self.peer,
                    detail: "missing or non-positive metadata_size".to_string(),
                });
            }
            if metadata_size > SOFT_CAP_BYTES {
                return Err(CrawlError::ProtocolMismatch {
                    peer: self.peer,
                    detail: format!("metadata_size {metadata_size} exceeds soft cap"),
                });
            }
            return Ok((remote_ut_metadata, metadata_size as usize));
        }
    }

    fn fetch_piece(&mut self, index: usize, remote_ut_metadata: i64) -> Result<Vec<u8>, CrawlError> {
        let request = Value::dict()
            .set("msg_type", Value::Int(0))
            .set("piece", Value::Int(index as i64))
            .build()
            .encode();
        let mut frame = vec![EXTENDED_MSG_ID, remote_ut_metadata as u8];
        frame.extend_from_slice(&request);
        self.write_frame(&frame)?;

        loop {
            let Some(frame) = self.read_frame()? else { continue };
            if frame.is_empty() || frame[0] != EXTENDED_MSG_ID {
                continue;
            }
            if frame.len() < 2 || frame[1] as i64 != LOCAL_UT_METADATA_ID {
                continue; // some other extension; ignored per §4.5 step 3
            }
            let (dict, consumed) =
                Value::decode_prefix(&frame[2..]).map_err(|e| CrawlError::ProtocolMismatch {
                    peer: self.peer,
                    detail: e.to_string(),
                })?;
            let msg_type = dict.get("msg_type").and_then(Value::as_int).unwrap_or(-1);
            let piece = dict.get("piece").and_then(Value::as_int).unwrap_or(-1);
            match msg_type {
                1 if piece as usize == index => {
                    return Ok(frame[2 + consumed..].to_vec());
                }
                2 if piece as usize == index => {
                    return Err(CrawlError::ProtocolMismatch {
                        peer: self.peer,
                        detail: format!("peer rejected piece {index}"),
                    });
                }
                _ => continue, // out-of-order or unrelated extended message; ignore
            }
        }
    }

    fn remaining(&self) -> Result<Duration, CrawlError> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(CrawlError::Timeout { peer: self.peer });
        }
        Ok(self.deadline - now)
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<(), CrawlError> {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        self.write_all(&framed)
    }

    /// `None` means a keep-alive (zero-length) frame.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CrawlError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_FRAME_LEN {
            return Err(CrawlError::ProtocolMismatch {
                peer: self.peer,
                detail: format!("frame length {len} exceeds sanity cap"),
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), CrawlError> {
        let mut written = 0;
        while written < buf.len() {
            let remaining = self.remaining()?;
            self.poll
                .poll(&mut self.events, Some(remaining))
                .map_err(|e| CrawlError::TransportError { peer: self.peer, source: e })?;
            if self.events.is_empty() {
                return Err(CrawlError::Timeout { peer: self.peer });
            }
            match self.stream.write(&buf[written..]) {
                Ok(0) => {
                    return Err(CrawlError::TransportError {
                        peer: self.peer,
                        source: io::Error::new(io::ErrorKind::WriteZero, "connection closed"),
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(CrawlError::TransportError { peer: self.peer, source: e }),
            }
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CrawlError> {
        let mut read = 0;
        while read < buf.len() {
            let remaining = self.remaining()?;
            self.poll
                .poll(&mut self.events, Some(remaining))
                .map_err(|e| CrawlError::TransportError { peer: self.peer, source: e })?;
            if self.events.is_empty() {
                return Err(CrawlError::Timeout { peer: self.peer });
            }
            match self.stream.read(&mut buf[read..]) {
                Ok(0) => {
                    return Err(CrawlError::TransportError {
                        peer: self.peer,
                        source: io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
                    })
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(CrawlError::TransportError { peer: self.peer, source: e }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::thread;

    /// Drives a fake peer end-to-end through a real loopback TCP socket:
    /// handshake with the extension bit set, an ut_metadata handshake
    /// reply, and two 16 KiB pieces whose concatenation hashes to the
    /// infohash we ask for. This is scenario S5.
    #[test]
    fn scenario_s5_metadata_fetch_happy_path() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let metadata = {
            let mut m = vec![0u8; 32 * 1024];
            for (i, b) in m.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            m
        };
        let mut hasher = Sha1::new();
        hasher.update(&metadata);
        let infohash: [u8; 20] = hasher.finalize().into();

        let server_infohash = infohash;
        let server_metadata = metadata.clone();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hs_buf = [0u8; 68];
            read_exact_std(&mut stream, &mut hs_buf);
            let incoming = Handshake::from_bytes(&hs_buf).unwrap();
            assert!(incoming.supports_extensions());
            let reply = Handshake::new(server_infohash, [0xAB; 20]);
            stream.write_all(&reply.to_bytes()).unwrap();

            // extension handshake
            let ext_frame = read_frame_std(&mut stream);
            assert_eq!(ext_frame[0], EXTENDED_MSG_ID);
            assert_eq!(ext_frame[1], EXT_HANDSHAKE_ID);

            let reply_payload = Value::dict()
                .set("m", Value::dict().set("ut_metadata", Value::Int(3)).build())
                .set("metadata_size", Value::Int(server_metadata.len() as i64))
                .build()
                .encode();
            let mut frame = vec![EXTENDED_MSG_ID, EXT_HANDSHAKE_ID];
            frame.extend_from_slice(&reply_payload);
            write_frame_std(&mut stream, &frame);

            for index in 0..2 {
                let req_frame = read_frame_std(&mut stream);
                assert_eq!(req_frame[0], EXTENDED_MSG_ID);
                assert_eq!(req_frame[1], LOCAL_UT_METADATA_ID as u8);
                let (dict, _) = Value::decode_prefix(&req_frame[2..]).unwrap();
                assert_eq!(dict.get("piece").and_then(Value::as_int), Some(index));

                let start = index as usize * PIECE_LEN;
                let end = (start + PIECE_LEN).min(server_metadata.len());
                let piece_payload = Value::dict()
                    .set("msg_type", Value::Int(1))
                    .set("piece", Value::Int(index))
                    .build()
                    .encode();
                let mut frame = vec![EXTENDED_MSG_ID, 3u8];
                frame.extend_from_slice(&piece_payload);
                frame.extend_from_slice(&server_metadata[start..end]);
                write_frame_std(&mut stream, &frame);
            }
        });

        let wire = MetaWire::connect(addr, Duration::from_secs(5)).unwrap();
        let result = wire.fetch(&infohash, [0xCD; 20]).unwrap();
        assert_eq!(result, metadata);
        server.join().unwrap();
    }

    #[test]
    fn rejects_on_infohash_mismatch_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let expected = [1u8; 20];

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hs_buf = [0u8; 68];
            read_exact_std(&mut stream, &mut hs_buf);
            let reply = Handshake::new([2u8; 20], [0; 20]); // wrong infohash
            stream.write_all(&reply.to_bytes()).unwrap();
        });

        let wire = MetaWire::connect(addr, Duration::from_secs(2)).unwrap();
        let err = wire.fetch(&expected, [0; 20]).unwrap_err();
        assert!(matches!(err, CrawlError::ProtocolMismatch { .. }));
        server.join().unwrap();
    }

    fn read_exact_std(stream: &mut StdTcpStream, buf: &mut [u8]) {
        use std::io::Read;
        stream.read_exact(buf).unwrap();
    }

    fn read_frame_std(stream: &mut StdTcpStream) -> Vec<u8> {
        use std::io::Read;
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf);
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn write_frame_std(stream: &mut StdTcpStream, payload: &[u8]) {
        use std::io::Write;
        stream.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
        stream.write_all(payload).unwrap();
    }
}
