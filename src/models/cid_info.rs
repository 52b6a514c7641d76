use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cid::Cid;
use libp2p_identity::PeerId;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::config::ProvideOp;
use crate::models::{CidFetchResults, PeerInfo};

/// Per-CID tracking record; the single source of truth for one CID over the
/// whole study.
///
/// Identity fields are immutable. Round state lives behind a lock: the
/// publisher writes it exactly once during round 0, the pinger orchestrator
/// and one worker at a time touch it afterwards (rounds on a single CID are
/// strictly sequential).
#[derive(Debug)]
pub struct CidInfo {
    cid: Cid,
    /// Peer that published the records: this process, or the original
    /// publisher when the CID was replayed from a file.
    creator: PeerId,
    k: usize,
    prov_op: ProvideOp,
    req_interval: Duration,
    study_duration: Duration,
    state: RwLock<CidState>,
}

#[derive(Debug)]
struct CidState {
    publication_time: Option<DateTime<Utc>>,
    provide_latency: Option<Duration>,
    pr_holders: Vec<PeerInfo>,
    ping_counter: usize,
    next_ping: Instant,
    fetch_results: Vec<Arc<CidFetchResults>>,
}

impl CidInfo {
    pub fn new(
        cid: Cid,
        creator: PeerId,
        k: usize,
        prov_op: ProvideOp,
        req_interval: Duration,
        study_duration: Duration,
    ) -> Self {
        Self {
            cid,
            creator,
            k,
            prov_op,
            req_interval,
            study_duration,
            state: RwLock::new(CidState {
                publication_time: None,
                provide_latency: None,
                pr_holders: Vec::new(),
                ping_counter: 0,
                next_ping: Instant::now(),
                fetch_results: Vec::new(),
            }),
        }
    }

    /// Canonical string form of the CID, used as the key in every map and in
    /// externally-serialized records.
    pub fn key(&self) -> String {
        self.cid.to_string()
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn creator(&self) -> PeerId {
        self.creator
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn prov_op(&self) -> ProvideOp {
        self.prov_op
    }

    pub fn req_interval(&self) -> Duration {
        self.req_interval
    }

    pub fn study_duration(&self) -> Duration {
        self.study_duration
    }

    pub fn publication_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().publication_time
    }

    pub fn provide_latency(&self) -> Option<Duration> {
        self.state.read().provide_latency
    }

    /// Record the publication outcome. Called once, by the publisher worker
    /// that owns round 0.
    pub fn set_publication(&self, time: DateTime<Utc>, provide_latency: Duration) {
        let mut state = self.state.write();
        state.publication_time = Some(time);
        state.provide_latency = Some(provide_latency);
    }

    /// Append a PR holder, ignoring duplicates by peer id. Holders are only
    /// appended during round 0 and are frozen afterwards.
    pub fn add_pr_holder(&self, holder: PeerInfo) {
        let mut state = self.state.write();
        if state.pr_holders.iter().any(|h| h.peer_id == holder.peer_id) {
            return;
        }
        state.pr_holders.push(holder);
    }

    /// Snapshot of the holder set.
    pub fn pr_holders(&self) -> Vec<PeerInfo> {
        self.state.read().pr_holders.clone()
    }

    pub fn holder_count(&self) -> usize {
        self.state.read().pr_holders.len()
    }

    pub fn ping_counter(&self) -> usize {
        self.state.read().ping_counter
    }

    /// Bump the round counter at dispatch time; returns the round number the
    /// dispatched probe will run as.
    pub fn increase_ping_counter(&self) -> usize {
        let mut state = self.state.write();
        state.ping_counter += 1;
        state.ping_counter
    }

    pub fn next_ping(&self) -> Instant {
        self.state.read().next_ping
    }

    /// Move the next-due instant forward. `next_ping` never goes backwards.
    pub fn set_next_ping(&self, at: Instant) {
        let mut state = self.state.write();
        if at > state.next_ping {
            state.next_ping = at;
        }
    }

    /// Commit a finished round. Rounds on one CID are sequential, so the
    /// results arrive in round order.
    pub fn add_fetch_result(&self, fetch: Arc<CidFetchResults>) {
        self.state.write().fetch_results.push(fetch);
    }

    pub fn fetch_results(&self) -> Vec<Arc<CidFetchResults>> {
        self.state.read().fetch_results.clone()
    }

    pub fn rounds_recorded(&self) -> usize {
        self.state.read().fetch_results.len()
    }
}
