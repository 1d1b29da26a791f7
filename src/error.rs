//! Typed error kinds for the protocol layers (§7). `Coordinator` matches on
//! these to decide retry vs. blacklist-and-give-up; everything above the
//! coordinator (the DHT's `die` channel, `main`) deals in `anyhow::Result`
//! for context-chaining instead, at its own process boundary.
//!
//! §7 names two further kinds, `StoreError` and `ScrapeError`, that aren't
//! variants here: a store failure is `store::StoreError`, a distinct type
//! at the catalog boundary, and a scrape failure never reaches the
//! coordinator as an error at all — `tracker::Scraper::scrape_all` logs and
//! downgrades every per-tracker failure to `(0, 0)` before returning.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("protocol mismatch with {peer}: {detail}")]
    ProtocolMismatch { peer: SocketAddr, detail: String },

    #[error("timed out talking to {peer}")]
    Timeout { peer: SocketAddr },

    #[error("transport error with {peer}: {source}")]
    TransportError {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{peer} does not support ut_metadata")]
    ExtensionUnsupported { peer: SocketAddr },

    #[error("metadata from {peer} failed sha1 verification")]
    VerificationFailed { peer: SocketAddr },
}

impl CrawlError {
    /// §7: only `Timeout` and `TransportError` are retryable at the
    /// coordinator level; everything else indicates a peer that will
    /// never succeed and should go straight to the blacklist.
    pub fn retryable(&self) -> bool {
        matches!(self, CrawlError::Timeout { .. } | CrawlError::TransportError { .. })
    }
}
