use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use rand::RngCore;
use tracing::debug;

use crate::source::{CidSource, SourceError, TrackableCid};

/// Raw binary codec.
const RAW_CODEC: u64 = 0x55;

/// Default size of the random content behind each generated CID.
pub const DEFAULT_CONTENT_SIZE: usize = 1024;

/// Generates CIDv1 identifiers over freshly drawn random content.
///
/// The content itself is discarded; the study measures routing-record decay,
/// not data availability, so only the identifier matters.
#[derive(Debug, Clone)]
pub struct RandomCidGen {
    content_size: usize,
}

impl RandomCidGen {
    pub fn new(content_size: usize) -> Self {
        Self { content_size }
    }
}

impl Default for RandomCidGen {
    fn default() -> Self {
        Self::new(DEFAULT_CONTENT_SIZE)
    }
}

impl CidSource for RandomCidGen {
    fn next(&mut self) -> Result<Option<TrackableCid>, SourceError> {
        let mut content = vec![0u8; self.content_size];
        rand::thread_rng().fill_bytes(&mut content);

        let digest = Code::Sha2_256.digest(&content);
        let cid = Cid::new_v1(RAW_CODEC, digest);
        debug!(cid = %cid, "generated new cid");

        Ok(Some(TrackableCid::generated(cid)))
    }

    fn kind(&self) -> &'static str {
        "random-content-gen"
    }
}
