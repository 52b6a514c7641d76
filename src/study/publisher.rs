use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use cid::Cid;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StudyConfig;
use crate::db::SinkHandle;
use crate::host::{ConnError, DhtHost, MsgNotification, MsgType};
use crate::models::{CidFetchResults, CidInfo, PeerInfo, PrPingResult};
use crate::source::{CidSource, TrackableCid};
use crate::study::cid_set::CidSet;
use crate::study::pinger::{CidPinger, DIAL_GRACE_TIME};

/// Rendezvous between one publisher worker and the ADD_PROVIDER listener.
///
/// Created and registered under the CID key before `provide` is invoked, so
/// the listener can always resolve an incoming event. The publication round
/// is complete once one ping result per expected ADD_PROVIDER exchange has
/// been recorded; completion is signalled exactly once.
struct PublishSlot {
    expected: usize,
    state: Mutex<SlotState>,
}

struct SlotState {
    ping_results: Vec<PrPingResult>,
    done_tx: Option<oneshot::Sender<()>>,
}

impl PublishSlot {
    fn new(expected: usize) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (done_tx, done_rx) = oneshot::channel();
        let slot = Arc::new(Self {
            expected,
            state: Mutex::new(SlotState {
                ping_results: Vec::with_capacity(expected),
                done_tx: Some(done_tx),
            }),
        });
        (slot, done_rx)
    }

    fn add_ping_result(&self, result: PrPingResult) {
        let mut state = self.state.lock();
        state.ping_results.push(result);
        if state.ping_results.len() >= self.expected
            && let Some(done_tx) = state.done_tx.take()
        {
            let _ = done_tx.send(());
        }
    }

    fn take_ping_results(&self) -> Vec<PrPingResult> {
        std::mem::take(&mut self.state.lock().ping_results)
    }
}

/// Worker pool that draws CIDs from the source, publishes them through the
/// host, and assembles the round-0 holder set from the host's ADD_PROVIDER
/// events.
pub struct CidPublisher {
    ctx: PublishCtx,
    cid_number: usize,
    workers: usize,
}

/// Shared context cloned into every worker and the listener.
#[derive(Clone)]
struct PublishCtx {
    host: Arc<dyn DhtHost>,
    db: SinkHandle,
    cid_set: Arc<CidSet>,
    pinger: Arc<CidPinger>,
    slots: Arc<DashMap<String, Arc<PublishSlot>>>,
    config: StudyConfig,
    /// Fires when the listener is gone; workers must stop waiting on
    /// rendezvous that can no longer complete.
    listener_down: CancellationToken,
    cancel: CancellationToken,
}

impl CidPublisher {
    pub fn new(
        host: Arc<dyn DhtHost>,
        db: SinkHandle,
        cid_set: Arc<CidSet>,
        pinger: Arc<CidPinger>,
        config: StudyConfig,
        cancel: CancellationToken,
    ) -> Self {
        let cid_number = config.cid_number;
        let workers = config.publisher_workers;
        Self {
            ctx: PublishCtx {
                host,
                db,
                cid_set,
                pinger,
                slots: Arc::new(DashMap::new()),
                config,
                listener_down: CancellationToken::new(),
                cancel,
            },
            cid_number,
            workers,
        }
    }

    /// Publish every CID the source yields, then stage down: generation
    /// done (source channel closes) -> workers drain -> listener stops.
    pub async fn run(&self, source: Box<dyn CidSource>) -> Result<()> {
        info!(
            workers = self.workers,
            cids = self.cid_number,
            kind = source.kind(),
            "starting publication"
        );

        let publication_done = CancellationToken::new();
        let listener = tokio::spawn(listener_loop(
            self.ctx.clone(),
            self.ctx.host.msg_notifier().subscribe(),
            publication_done.clone(),
        ));

        let (cid_tx, cid_rx) = mpsc::channel::<TrackableCid>(self.workers);
        let generator = spawn_generator(source, self.cid_number, cid_tx, self.ctx.cancel.clone());
        let cid_rx = Arc::new(tokio::sync::Mutex::new(cid_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let ctx = self.ctx.clone();
            let cid_rx = cid_rx.clone();
            workers.spawn(worker_loop(ctx, worker_id, cid_rx));
        }

        // A panicking worker does not poison the pool; the others carry on.
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined
                && err.is_panic()
            {
                error!(error = %err, "publisher worker panicked");
            }
        }
        info!("publication process finished");

        // No more ADD_PROVIDER events of interest can arrive.
        publication_done.cancel();
        listener
            .await
            .map_err(|err| anyhow!("add-provider listener died: {err}"))?;

        generator
            .await
            .map_err(|err| anyhow!("cid generator failed: {err}"))?;
        Ok(())
    }
}

/// Draw up to `cid_number` entries from the source. Closing the channel is
/// the generation-done signal the workers key off.
fn spawn_generator(
    mut source: Box<dyn CidSource>,
    cid_number: usize,
    tx: mpsc::Sender<TrackableCid>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut drawn = 0usize;
        while drawn < cid_number {
            if cancel.is_cancelled() {
                info!("shutdown detected, stopping cid generation");
                return;
            }
            match source.next() {
                Ok(Some(trackable)) => {
                    if tx.blocking_send(trackable).is_err() {
                        return;
                    }
                    drawn += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, kind = source.kind(), "cid source failed, skipping entry");
                }
            }
        }
        info!(drawn, kind = source.kind(), "cid generation finished");
    })
}

async fn worker_loop(
    ctx: PublishCtx,
    worker_id: usize,
    cid_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TrackableCid>>>,
) {
    debug!(worker_id, "publisher ready");
    loop {
        let next = {
            let mut rx = cid_rx.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!(worker_id, "shutdown detected, closing publisher worker");
                    return;
                }
                next = rx.recv() => next,
            }
        };
        let Some(trackable) = next else {
            debug!(worker_id, "generation finished, closing publisher worker");
            return;
        };
        publish_cid(&ctx, worker_id, trackable).await;
    }
}

async fn publish_cid(ctx: &PublishCtx, worker_id: usize, trackable: TrackableCid) {
    if ctx.listener_down.is_cancelled() {
        return;
    }
    let cid = trackable.cid;
    let key = cid.to_string();
    debug!(worker_id, cid = %key, "new cid to publish");

    let creator = trackable.creator.unwrap_or_else(|| ctx.host.id());
    let info = Arc::new(CidInfo::new(
        cid,
        creator,
        ctx.config.k,
        ctx.config.prov_op,
        ctx.config.req_interval,
        ctx.config.study_duration,
    ));

    // A replayed record names the peer already holding it; that peer joins
    // the holder set up front and gets probed like any event-discovered one.
    if let Some(provider) = trackable.provider {
        info.add_pr_holder(PeerInfo::new(
            provider,
            trackable.multiaddrs.clone(),
            trackable.user_agent.clone().unwrap_or_default(),
        ));
    }

    // Track the CID and register its slot before providing; the listener
    // resolves every event through these two maps.
    if !ctx.cid_set.insert_if_absent(info.clone()) {
        warn!(cid = %key, "cid already tracked, skipping duplicate");
        return;
    }
    let (slot, done_rx) = PublishSlot::new(ctx.config.k);
    ctx.slots.insert(key.clone(), slot.clone());

    let publication_time = Utc::now();
    let provide_started = tokio::time::Instant::now();
    let provide = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            ctx.slots.remove(&key);
            return;
        }
        provide = ctx.host.provide(&cid) => provide,
    };
    let provide_failed = provide.is_err();
    let (provide_latency, lookup_metrics) = match provide {
        Ok((latency, metrics)) => (latency, metrics),
        Err(err) => {
            error!(cid = %key, error = %err, "unable to provide content");
            (provide_started.elapsed(), None)
        }
    };

    // Join with the listener: one event per ADD_PROVIDER the provide sent.
    // A failed provide may have aborted its sweep early, so that path only
    // waits out a grace window for stragglers.
    let rendezvous = async {
        if provide_failed {
            let _ = tokio::time::timeout(DIAL_GRACE_TIME, done_rx).await;
        } else {
            let _ = done_rx.await;
        }
    };
    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            ctx.slots.remove(&key);
            return;
        }
        _ = ctx.listener_down.cancelled() => {
            // The rendezvous can never complete; abandon the publication.
            ctx.slots.remove(&key);
            return;
        }
        _ = rendezvous => {}
    }
    let ping_results = slot.take_ping_results();
    ctx.slots.remove(&key);

    // Fresh lookup: is the just-published content already reachable through
    // normal routing?
    let lookup_started = tokio::time::Instant::now();
    let mut find_prov_duration = Duration::ZERO;
    let mut is_retrievable = false;
    tokio::select! {
        _ = ctx.cancel.cancelled() => {}
        lookup = ctx.host.lookup_providers(&cid) => {
            find_prov_duration = lookup_started.elapsed();
            match lookup {
                Ok(providers) => {
                    is_retrievable = providers.iter().any(|p| p.peer_id == creator);
                }
                Err(err) => warn!(cid = %key, error = %err, "provider lookup after publication failed"),
            }
        }
    }

    let (total_hops, hops_tree_depth, hops_to_closest, closest_peers) = match lookup_metrics {
        Some(metrics) => (
            Some(metrics.total_hops),
            Some(metrics.tree_depth),
            Some(metrics.min_hops_to_closest),
            metrics.closest_peers,
        ),
        None => (None, None, None, Vec::new()),
    };

    let fetch = Arc::new(CidFetchResults {
        cid,
        round: 0,
        start_time: publication_time,
        finish_time: Utc::now(),
        is_retrievable,
        total_hops,
        hops_to_closest,
        hops_tree_depth,
        find_prov_duration,
        get_closest_peers_duration: Duration::ZERO,
        closest_peers,
        pr_ping_results: ping_results,
    });

    // Replayed records keep their original publication facts; generated
    // CIDs record what was just measured.
    let recorded_time = trackable.publication_time.unwrap_or(publication_time);
    let recorded_latency = trackable.provide_latency.unwrap_or(provide_latency);
    info.set_publication(recorded_time, recorded_latency);
    info.add_fetch_result(fetch.clone());
    // Round 1 is due one interval after the publication round finished.
    info.set_next_ping(tokio::time::Instant::now() + ctx.config.req_interval);

    ctx.db.add_cid_info(info.clone()).await;
    for holder in info.pr_holders() {
        ctx.db.add_peer_info(cid, holder).await;
    }
    ctx.db.add_fetch_results(fetch.clone()).await;
    ctx.db.add_ping_results(fetch.pr_ping_results.clone()).await;

    let (total, successful, failed) = fetch.summary();
    if total == 0 {
        warn!(cid = %key, "no ping results for the publication round");
    } else {
        info!(cid = %key, total, successful, failed, "published cid");
    }

    ctx.pinger.add_cid_info(info);
}

/// Listener half of the rendezvous: consumes the host's message events and
/// amends the matching in-flight publication.
async fn listener_loop(
    ctx: PublishCtx,
    mut events: broadcast::Receiver<MsgNotification>,
    publication_done: CancellationToken,
) {
    // Whatever takes this task down, panics included, releases any worker
    // still parked on a rendezvous.
    let _down_guard = ctx.listener_down.clone().drop_guard();
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                info!("shutdown detected, closing add-provider listener");
                return;
            }
            _ = publication_done.cancelled() => {
                info!("publication done, closing add-provider listener");
                return;
            }
            event = events.recv() => match event {
                Ok(event) => handle_notification(&ctx, event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "add-provider listener lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("message notifier closed, stopping listener");
                    return;
                }
            }
        }
    }
}

fn handle_notification(ctx: &PublishCtx, event: MsgNotification) {
    if event.msg_type != MsgType::AddProvider {
        return;
    }
    let cid = match Cid::try_from(event.key.as_slice()) {
        Ok(cid) => cid,
        Err(err) => {
            error!(error = %err, "unable to decode message key as cid, dropping event");
            return;
        }
    };
    let key = cid.to_string();

    // Tracking precedes providing, so both lookups must succeed; anything
    // else is a bug worth dying for.
    let info = ctx
        .cid_set
        .get(&key)
        .unwrap_or_else(|| panic!("received ADD_PROVIDER for untracked cid {key}"));
    let slot = ctx
        .slots
        .get(&key)
        .map(|entry| entry.value().clone())
        .unwrap_or_else(|| panic!("no publication slot registered for cid {key}"));

    let (active, conn_error) = match &event.error {
        None => (true, ConnError::None),
        Some(err) => {
            debug!(cid = %key, peer = %event.remote_peer, error = %err, "holder rejected provider record");
            (false, ConnError::from(err))
        }
    };

    if active {
        debug!(cid = %key, peer = %event.remote_peer, "holder accepted provider record");
        let multiaddrs = ctx.host.multiaddrs_of_peer(event.remote_peer);
        let user_agent = ctx.host.user_agent_of_peer(event.remote_peer).unwrap_or_default();
        info.add_pr_holder(PeerInfo::new(event.remote_peer, multiaddrs, user_agent));
    }

    slot.add_ping_result(PrPingResult {
        cid,
        peer_id: event.remote_peer,
        round: 0,
        ping_time: event.query_time,
        ping_duration: event.query_duration,
        active,
        has_records: false,
        conn_error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_signals_once_expected_count_is_met() {
        let (slot, done_rx) = PublishSlot::new(2);
        let cid = Cid::default();
        let ping = |peer| PrPingResult {
            cid,
            peer_id: peer,
            round: 0,
            ping_time: Utc::now(),
            ping_duration: Duration::from_millis(5),
            active: true,
            has_records: false,
            conn_error: ConnError::None,
        };

        slot.add_ping_result(ping(libp2p_identity::PeerId::random()));
        slot.add_ping_result(ping(libp2p_identity::PeerId::random()));

        done_rx.await.expect("completion must fire");
        assert_eq!(slot.take_ping_results().len(), 2);
    }

    #[tokio::test]
    async fn slot_does_not_signal_early() {
        let (slot, mut done_rx) = PublishSlot::new(3);
        slot.add_ping_result(PrPingResult {
            cid: Cid::default(),
            peer_id: libp2p_identity::PeerId::random(),
            round: 0,
            ping_time: Utc::now(),
            ping_duration: Duration::ZERO,
            active: false,
            has_records: false,
            conn_error: ConnError::PeerUnreachable,
        });

        assert!(done_rx.try_recv().is_err());
    }
}
