use std::time::Duration;

use chrono::{DateTime, Utc};
use cid::Cid;
use libp2p_identity::PeerId;

use crate::host::ConnError;

/// Outcome of probing a single PR holder in one round.
///
/// Round 0 entries are synthesized from the ADD_PROVIDER exchange during
/// publication (`has_records` is always false there: accepting a record is
/// not the same as proving possession). Rounds >= 1 come from a live dial.
#[derive(Debug, Clone)]
pub struct PrPingResult {
    pub cid: Cid,
    pub peer_id: PeerId,
    pub round: usize,
    /// Wall-clock instant the probe started.
    pub ping_time: DateTime<Utc>,
    pub ping_duration: Duration,
    /// The holder answered the dial (or the ADD_PROVIDER RPC) successfully.
    pub active: bool,
    /// A fresh GET_PROVIDERS against the holder returned the creator.
    pub has_records: bool,
    pub conn_error: ConnError,
}

/// Everything observed about one CID in one probe round.
///
/// Assembled as an owned value once the round's concurrent sub-tasks have
/// joined; never mutated afterwards. Hop fields are `None` when the
/// underlying lookup produced no instrumentation.
#[derive(Debug, Clone)]
pub struct CidFetchResults {
    pub cid: Cid,
    pub round: usize,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    /// A fresh provider lookup returned the creator.
    pub is_retrievable: bool,
    pub total_hops: Option<usize>,
    pub hops_to_closest: Option<usize>,
    pub hops_tree_depth: Option<usize>,
    pub find_prov_duration: Duration,
    pub get_closest_peers_duration: Duration,
    pub closest_peers: Vec<PeerId>,
    pub pr_ping_results: Vec<PrPingResult>,
}

impl CidFetchResults {
    /// Per-round holder accounting: (total, successful, failed).
    pub fn summary(&self) -> (usize, usize, usize) {
        let total = self.pr_ping_results.len();
        let successful = self.pr_ping_results.iter().filter(|p| p.active).count();
        (total, successful, total - successful)
    }
}
