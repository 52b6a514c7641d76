//! CID supply for a study.
//!
//! A [`CidSource`] lazily yields [`TrackableCid`]s: freshly generated random
//! content ([`RandomCidGen`]) or records replayed from a previous study's
//! JSON export ([`JsonFileCidSource`]). End of stream is `Ok(None)`.

mod json_file;
mod random;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cid::Cid;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use snafu::Snafu;

pub use json_file::{JsonFileCidSource, ProviderRecord, ProviderRecords};
pub use random::{DEFAULT_CONTENT_SIZE, RandomCidGen};

/// A CID drawn from a source.
///
/// Replayed records also carry the original publication facts: the peer that
/// holds the provider record, the creator that published it, and the
/// publication timing. Generated CIDs leave those empty; the publisher fills
/// them in at publication time.
#[derive(Debug, Clone)]
pub struct TrackableCid {
    pub cid: Cid,
    /// Peer holding the replayed provider record.
    pub provider: Option<PeerId>,
    /// Original publisher of the replayed record.
    pub creator: Option<PeerId>,
    pub provide_latency: Option<Duration>,
    pub publication_time: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    /// Addresses the replayed provider was reachable on.
    pub multiaddrs: Vec<Multiaddr>,
}

impl TrackableCid {
    /// A freshly generated CID with no replayed history.
    pub fn generated(cid: Cid) -> Self {
        Self {
            cid,
            provider: None,
            creator: None,
            provide_latency: None,
            publication_time: None,
            user_agent: None,
            multiaddrs: Vec::new(),
        }
    }

    /// Whether this CID replays a previously published record.
    pub fn is_replayed(&self) -> bool {
        self.creator.is_some()
    }
}

/// Construction-time failures of a CID source. Anything recoverable
/// (a malformed record) is skipped inside `next` instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    #[snafu(display("failed to open cid file {}: {source}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to read cid file {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse provider records in {}: {source}", path.display()))]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Lazy sequence of candidate CIDs.
pub trait CidSource: Send {
    /// Next CID, or `Ok(None)` once the source is exhausted.
    fn next(&mut self) -> Result<Option<TrackableCid>, SourceError>;

    /// Human-readable source kind, for logs and the persisted dataset.
    fn kind(&self) -> &'static str;
}
