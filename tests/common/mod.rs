//! Deterministic scripted DHT host for driving the engine end to end.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use cid::Cid;
use cidwatch::host::{
    AddrInfo, DhtHost, DialError, Hops, LookupMetrics, MsgNotification, MsgNotifier, MsgType,
};
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use parking_lot::Mutex;

/// In-memory host whose every reaction is scripted by the test.
///
/// `provide` synchronously emits one ADD_PROVIDER notification per
/// configured holder, mirroring how a real host reports each RPC of the
/// provide sweep.
pub struct ScriptedHost {
    local_id: PeerId,
    notifier: MsgNotifier,
    /// Peers the provide sweep contacts, in order.
    holders: Vec<PeerId>,
    /// Holders that reject the provider record.
    provide_failures: Mutex<Vec<PeerId>>,
    /// Peers a fresh provider lookup returns.
    lookup_providers: Mutex<Vec<PeerId>>,
    /// Providers any holder reports when asked for its records.
    records: Mutex<Vec<PeerId>>,
    /// Scripted dial outcomes per peer, consumed front to back; missing or
    /// exhausted entries dial fine.
    dial_script: Mutex<HashMap<PeerId, VecDeque<Result<(), DialError>>>>,
    dial_attempts: Mutex<HashMap<PeerId, usize>>,
    provide_calls: AtomicUsize,
    /// Emit one ADD_PROVIDER for a CID nobody tracks.
    spurious_event: AtomicBool,
}

impl ScriptedHost {
    pub fn new(holders: Vec<PeerId>) -> Arc<Self> {
        Arc::new(Self {
            local_id: PeerId::random(),
            notifier: MsgNotifier::new(),
            holders,
            provide_failures: Mutex::new(Vec::new()),
            lookup_providers: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            dial_script: Mutex::new(HashMap::new()),
            dial_attempts: Mutex::new(HashMap::new()),
            provide_calls: AtomicUsize::new(0),
            spurious_event: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Make every holder reject the provider record.
    pub fn fail_all_provides(&self) {
        *self.provide_failures.lock() = self.holders.clone();
    }

    pub fn set_lookup_providers(&self, providers: Vec<PeerId>) {
        *self.lookup_providers.lock() = providers;
    }

    /// Fresh lookups find this host itself, as they do right after a
    /// healthy publication.
    pub fn echo_self_on_lookup(&self) {
        self.set_lookup_providers(vec![self.local_id]);
    }

    pub fn set_records(&self, providers: Vec<PeerId>) {
        *self.records.lock() = providers;
    }

    pub fn script_dials(&self, peer: PeerId, outcomes: Vec<Result<(), DialError>>) {
        self.dial_script.lock().insert(peer, outcomes.into());
    }

    pub fn dial_attempts(&self, peer: PeerId) -> usize {
        self.dial_attempts.lock().get(&peer).copied().unwrap_or(0)
    }

    pub fn provide_calls(&self) -> usize {
        self.provide_calls.load(Ordering::SeqCst)
    }

    pub fn emit_spurious_event(&self) {
        self.spurious_event.store(true, Ordering::SeqCst);
    }

    fn addr_of(peer: PeerId) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}").parse().unwrap()
    }
}

#[async_trait]
impl DhtHost for ScriptedHost {
    fn id(&self) -> PeerId {
        self.local_id
    }

    fn msg_notifier(&self) -> &MsgNotifier {
        &self.notifier
    }

    async fn provide(&self, cid: &Cid) -> Result<(Duration, Option<LookupMetrics>)> {
        self.provide_calls.fetch_add(1, Ordering::SeqCst);

        if self.spurious_event.swap(false, Ordering::SeqCst) {
            let unknown = Cid::new_v1(
                0x55,
                multihash_codetable::MultihashDigest::digest(
                    &multihash_codetable::Code::Sha2_256,
                    b"never published",
                ),
            );
            self.notifier.notify(MsgNotification {
                msg_type: MsgType::AddProvider,
                remote_peer: self.holders[0],
                key: unknown.to_bytes(),
                query_time: Utc::now(),
                query_duration: Duration::from_millis(2),
                error: None,
            });
        }

        let failures = self.provide_failures.lock().clone();
        for holder in &self.holders {
            let error = failures
                .contains(holder)
                .then_some(DialError::PeerUnreachable);
            self.notifier.notify(MsgNotification {
                msg_type: MsgType::AddProvider,
                remote_peer: *holder,
                key: cid.to_bytes(),
                query_time: Utc::now(),
                query_duration: Duration::from_millis(7),
                error,
            });
        }

        let metrics = LookupMetrics {
            total_hops: 4,
            tree_depth: 2,
            min_hops_to_closest: 1,
            closest_peers: self.holders.clone(),
        };
        Ok((Duration::from_millis(25), Some(metrics)))
    }

    async fn lookup_providers(&self, _cid: &Cid) -> Result<Vec<AddrInfo>> {
        Ok(self
            .lookup_providers
            .lock()
            .iter()
            .map(|peer| AddrInfo {
                peer_id: *peer,
                multiaddrs: vec![Self::addr_of(*peer)],
            })
            .collect())
    }

    async fn closest_peers(&self, _key: &[u8]) -> Result<(Vec<PeerId>, Hops)> {
        Ok((
            self.holders.clone(),
            Hops {
                total: 3,
                to_closest: 1,
            },
        ))
    }

    async fn providers_from_peer(&self, _peer: PeerId, _key: &[u8]) -> Result<Vec<AddrInfo>> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|peer| AddrInfo {
                peer_id: *peer,
                multiaddrs: Vec::new(),
            })
            .collect())
    }

    async fn connect(&self, target: &AddrInfo) -> Result<(), DialError> {
        *self
            .dial_attempts
            .lock()
            .entry(target.peer_id)
            .or_insert(0) += 1;

        let mut script = self.dial_script.lock();
        match script.get_mut(&target.peer_id).and_then(|q| q.pop_front()) {
            Some(outcome) => outcome,
            None => Ok(()),
        }
    }

    async fn close_peer(&self, _peer: PeerId) -> Result<()> {
        Ok(())
    }

    fn multiaddrs_of_peer(&self, peer: PeerId) -> Vec<Multiaddr> {
        vec![Self::addr_of(peer)]
    }

    fn user_agent_of_peer(&self, _peer: PeerId) -> Option<String> {
        Some("scripted-host/1.0".to_string())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
