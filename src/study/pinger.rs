use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::SinkHandle;
use crate::host::{ConnError, DhtHost};
use crate::models::{CidFetchResults, CidInfo, PeerInfo, PrPingResult};
use crate::study::cid_queue::CidQueue;

/// Per-attempt dial budget.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Dial attempts per holder per round; only transient failures retry.
pub const MAX_DIAL_ATTEMPTS: usize = 3;

/// Orchestrator tick, bounding CPU in light-load regimes.
pub const MIN_ITER_TIME: Duration = Duration::from_millis(500);

/// How long to keep collecting straggler ADD_PROVIDER events after a
/// provide call failed part-way through its sweep.
pub const DIAL_GRACE_TIME: Duration = Duration::from_secs(10);

/// One dispatched probe round.
struct PingTask {
    info: Arc<CidInfo>,
    round: usize,
}

/// Scheduler plus worker pool that re-probes every tracked CID until it has
/// completed its rounds.
///
/// The orchestrator walks the time-ordered queue on a fixed tick and feeds
/// due CIDs to a bounded task channel; closing that channel is the workers'
/// stop signal. Rounds on one CID are strictly sequential: a CID is only
/// dispatched again after the previous round committed and pushed its
/// `next_ping` forward.
pub struct CidPinger {
    host: Arc<dyn DhtHost>,
    db: SinkHandle,
    queue: CidQueue,
    rounds: usize,
    workers: usize,
    initialized: AtomicBool,
    init: Notify,
    /// Fired by the orchestrating study once no further CIDs will arrive.
    no_more_cids: CancellationToken,
    cancel: CancellationToken,
}

impl CidPinger {
    pub fn new(
        host: Arc<dyn DhtHost>,
        db: SinkHandle,
        rounds: usize,
        workers: usize,
        no_more_cids: CancellationToken,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            db,
            queue: CidQueue::new(),
            rounds,
            workers,
            initialized: AtomicBool::new(false),
            init: Notify::new(),
            no_more_cids,
            cancel,
        })
    }

    /// Queue a freshly published CID for probing. The first insertion
    /// releases the orchestrator from its init gate.
    pub fn add_cid_info(&self, info: Arc<CidInfo>) {
        self.queue.push(info);
        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.init.notify_one();
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Run the scheduler and the worker pool to completion.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (task_tx, task_rx) = mpsc::channel::<PingTask>(self.workers);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let pinger = self.clone();
            let task_rx = task_rx.clone();
            workers.spawn(async move { pinger.worker_loop(worker_id, task_rx).await });
        }

        // The scheduler runs here; dropping `task_tx` on return closes the
        // task channel and lets the workers drain out.
        self.orchestrate(task_tx).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined
                && err.is_panic()
            {
                // One poisoned round must not take the pool down.
                error!(error = %err, "pinger worker panicked");
            }
        }
        info!(rounds = self.rounds, "finished pinging tracked cids");
        Ok(())
    }

    async fn orchestrate(&self, task_tx: mpsc::Sender<PingTask>) {
        // Park until the first CID is queued, or until the study ends
        // without ever queueing one.
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("shutdown detected, closing ping orchestrator");
                return;
            }
            _ = self.init.notified() => {}
            _ = self.no_more_cids.cancelled() => {
                if self.queue.is_empty() {
                    info!("no cids were queued, closing ping orchestrator");
                    return;
                }
            }
        }

        let mut ticker = interval(MIN_ITER_TIME);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.queue.sort();
            for info in self.queue.snapshot() {
                if self.cancel.is_cancelled() {
                    info!("shutdown detected, closing ping orchestrator");
                    return;
                }
                if info.next_ping() > Instant::now() {
                    // Sorted queue: everything further out is future too.
                    break;
                }
                let key = info.key();

                // `rounds` counts the publication round; nothing is
                // dispatched past round rounds-1.
                if info.ping_counter() + 1 >= self.rounds {
                    self.queue.remove(&key);
                    info!(cid = %key, rounds = self.rounds, "cid completed all rounds");
                    continue;
                }

                let round = info.increase_ping_counter();
                let task = PingTask {
                    info: info.clone(),
                    round,
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    sent = task_tx.send(task) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                // Provisional hold-off; the worker pushes it to
                // finish + interval when the round commits.
                info.set_next_ping(Instant::now() + info.req_interval());

                if round + 1 >= self.rounds {
                    self.queue.remove(&key);
                    info!(cid = %key, round, "cid dispatched its final round");
                }
            }

            if self.queue.is_empty() && self.no_more_cids.is_cancelled() {
                info!("ping queue drained, closing orchestrator");
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown detected, closing ping orchestrator");
                    return;
                }
                _ = ticker.tick() => {}
            }
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PingTask>>>,
    ) {
        debug!(worker_id, "pinger worker initialized");
        loop {
            let task = {
                let mut rx = task_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(worker_id, "shutdown detected, closing pinger worker");
                        return;
                    }
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else {
                debug!(worker_id, "no more pings to orchestrate, closing pinger worker");
                return;
            };
            // Rounds are discarded whole on shutdown; a persisted round is
            // always complete.
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(worker_id, "round discarded on shutdown");
                    return;
                }
                _ = self.ping_cid(task) => {}
            }
        }
    }

    /// One full probe round: provider lookup, closest-peers walk, and the
    /// per-holder dial fan-out, joined into a single fetch result.
    async fn ping_cid(&self, task: PingTask) {
        let info = task.info;
        let round = task.round;
        let cid = info.cid();
        let key = info.key();
        let creator = info.creator();
        info!(cid = %key, round, creator = %creator, "pinging cid");

        let start_time = Utc::now();
        let holders = info.pr_holders();
        let hash_bytes = cid.hash().to_bytes();

        let find_providers = async {
            let started = Instant::now();
            let result = self.host.lookup_providers(&cid).await;
            (started.elapsed(), result)
        };
        let closest_peers = async {
            let started = Instant::now();
            let result = self.host.closest_peers(&hash_bytes).await;
            (started.elapsed(), result)
        };
        let holder_probes = join_all(
            holders
                .iter()
                .map(|holder| self.ping_pr_holder(&info, round, holder)),
        );

        let ((find_duration, find_result), (closest_duration, closest_result), ping_results) =
            tokio::join!(find_providers, closest_peers, holder_probes);

        let is_retrievable = match find_result {
            Ok(providers) => providers.iter().any(|p| p.peer_id == creator),
            Err(err) => {
                warn!(cid = %key, error = %err, "provider lookup failed");
                false
            }
        };
        let (closest, hops) = match closest_result {
            Ok((peers, hops)) => (peers, Some(hops)),
            Err(err) => {
                warn!(cid = %key, error = %err, "closest-peers lookup failed");
                (Vec::new(), None)
            }
        };

        let fetch = Arc::new(CidFetchResults {
            cid,
            round,
            start_time,
            finish_time: Utc::now(),
            is_retrievable,
            total_hops: hops.map(|h| h.total),
            hops_to_closest: hops.map(|h| h.to_closest),
            hops_tree_depth: None,
            find_prov_duration: find_duration,
            get_closest_peers_duration: closest_duration,
            closest_peers: closest,
            pr_ping_results: ping_results,
        });

        info.add_fetch_result(fetch.clone());
        info.set_next_ping(Instant::now() + info.req_interval());

        self.db.add_fetch_results(fetch.clone()).await;
        self.db.add_ping_results(fetch.pr_ping_results.clone()).await;

        let (total, successful, failed) = fetch.summary();
        info!(cid = %key, round, total, successful, failed, "round finished");
    }

    /// Dial one PR holder and, if reachable, ask it for the records it
    /// stores under the CID.
    async fn ping_pr_holder(&self, info: &CidInfo, round: usize, holder: &PeerInfo) -> PrPingResult {
        let target = holder.addr_info();
        let key_bytes = info.cid().hash().to_bytes();
        let ping_time = Utc::now();
        let started = Instant::now();

        let mut active = false;
        let mut has_records = false;
        let mut conn_error = ConnError::None;

        for attempt in 1..=MAX_DIAL_ATTEMPTS {
            match timeout(DIAL_TIMEOUT, self.host.connect(&target)).await {
                Err(_) => {
                    debug!(peer = %holder.peer_id, attempt, "dial timed out");
                    conn_error = ConnError::Timeout;
                    break;
                }
                Ok(Err(err)) => {
                    debug!(peer = %holder.peer_id, attempt, error = %err, "dial failed");
                    conn_error = ConnError::from(&err);
                    if !err.is_transient() {
                        break;
                    }
                }
                Ok(Ok(())) => {
                    active = true;
                    conn_error = ConnError::None;
                    match self.host.providers_from_peer(holder.peer_id, &key_bytes).await {
                        Ok(providers) => {
                            has_records = providers.iter().any(|p| p.peer_id == info.creator());
                        }
                        Err(err) => {
                            warn!(peer = %holder.peer_id, error = %err, "unable to retrieve providers from holder");
                        }
                    }
                    if let Err(err) = self.host.close_peer(holder.peer_id).await {
                        warn!(peer = %holder.peer_id, error = %err, "unable to close connection");
                    }
                    break;
                }
            }
        }

        PrPingResult {
            cid: info.cid(),
            peer_id: holder.peer_id,
            round,
            ping_time,
            ping_duration: started.elapsed(),
            active,
            has_records,
            conn_error,
        }
    }
}
