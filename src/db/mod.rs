//! Durable sink bridging the hot paths to the relational store.
//!
//! Four bounded channels, one per record kind, each served by a dedicated
//! background persister holding a pooled SQLite connection. Producers block
//! only when a channel is full; that backpressure is the pipeline's load
//! regulator and must not be buffered around.
//!
//! Shutdown: [`DbSink::close`] fires a single done pulse once producers
//! have drained; each persister then empties its channel and exits.
//! Cancelling the root token short-circuits the persisters immediately,
//! losing whatever is still buffered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cid::Cid;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, params};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{CidFetchResults, CidInfo, PeerInfo, PrPingResult};

/// Suggested capacity of each sink channel.
pub const DEFAULT_SINK_CAPACITY: usize = 10_000;

/// Connections in the SQLite pool: one per persister.
const POOL_SIZE: u32 = 4;

#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display("failed to open sqlite database at {}: {source}", path.display()))]
    OpenDatabase { path: PathBuf, source: r2d2::Error },

    #[snafu(display("connection pool error: {source}"))]
    Pool { source: r2d2::Error },

    #[snafu(display("failed to execute SQL statement: {source}"))]
    Execute { source: rusqlite::Error },

    #[snafu(display("failed to serialize column value: {source}"))]
    SerializeColumn { source: serde_json::Error },
}

/// Cloneable producer handle over the four sink channels.
///
/// Send failures mean the sink has already shut down; the row is logged and
/// dropped rather than crashing the caller.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    cid_info_tx: mpsc::Sender<Arc<CidInfo>>,
    peer_info_tx: mpsc::Sender<(Cid, PeerInfo)>,
    fetch_results_tx: mpsc::Sender<Arc<CidFetchResults>>,
    ping_results_tx: mpsc::Sender<Vec<PrPingResult>>,
}

impl SinkHandle {
    pub async fn add_cid_info(&self, info: Arc<CidInfo>) {
        if self.cid_info_tx.send(info).await.is_err() {
            warn!("sink closed, dropping cid info row");
        }
    }

    pub async fn add_peer_info(&self, cid: Cid, peer: PeerInfo) {
        if self.peer_info_tx.send((cid, peer)).await.is_err() {
            warn!("sink closed, dropping peer info row");
        }
    }

    pub async fn add_fetch_results(&self, fetch: Arc<CidFetchResults>) {
        if self.fetch_results_tx.send(fetch).await.is_err() {
            warn!("sink closed, dropping fetch results row");
        }
    }

    pub async fn add_ping_results(&self, pings: Vec<PrPingResult>) {
        if pings.is_empty() {
            return;
        }
        if self.ping_results_tx.send(pings).await.is_err() {
            warn!("sink closed, dropping ping results batch");
        }
    }
}

/// The sink itself: owns the channels' sending side and the persister tasks.
pub struct DbSink {
    handle: SinkHandle,
    done: CancellationToken,
    persisters: Vec<JoinHandle<()>>,
}

impl DbSink {
    /// Open (or create) the study database and start the persisters.
    pub fn open(path: &Path, cancel: CancellationToken) -> Result<Self, SinkError> {
        Self::open_with_capacity(path, DEFAULT_SINK_CAPACITY, cancel)
    }

    pub fn open_with_capacity(
        path: &Path,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<Self, SinkError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
        });
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .context(OpenDatabaseSnafu { path })?;

        let init_conn = pool.get().context(PoolSnafu)?;
        init_tables(&init_conn)?;
        drop(init_conn);
        info!(path = %path.display(), "study database initialised");

        let (cid_info_tx, cid_info_rx) = mpsc::channel(capacity);
        let (peer_info_tx, peer_info_rx) = mpsc::channel(capacity);
        let (fetch_results_tx, fetch_results_rx) = mpsc::channel(capacity);
        let (ping_results_tx, ping_results_rx) = mpsc::channel(capacity);

        let done = CancellationToken::new();
        let persisters = vec![
            spawn_persister("cid-info", cid_info_rx, pool.clone(), done.clone(), cancel.clone(), |conn, info: &Arc<CidInfo>| {
                insert_cid_info(conn, info)
            }),
            spawn_persister("peer-info", peer_info_rx, pool.clone(), done.clone(), cancel.clone(), |conn, row: &(Cid, PeerInfo)| {
                insert_peer_info(conn, &row.0, &row.1)
            }),
            spawn_persister("fetch-results", fetch_results_rx, pool.clone(), done.clone(), cancel.clone(), |conn, fetch: &Arc<CidFetchResults>| {
                insert_fetch_results(conn, fetch)
            }),
            spawn_persister("ping-results", ping_results_rx, pool, done.clone(), cancel, |conn, pings: &Vec<PrPingResult>| {
                insert_ping_results(conn, pings)
            }),
        ];

        Ok(Self {
            handle: SinkHandle {
                cid_info_tx,
                peer_info_tx,
                fetch_results_tx,
                ping_results_tx,
            },
            done,
            persisters,
        })
    }

    /// Producer handle to hand to the publisher and pinger.
    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Flush and stop. Called once producers have drained: fires the done
    /// pulse, lets every persister empty its channel, then joins them.
    pub async fn close(self) {
        let DbSink {
            handle,
            done,
            persisters,
        } = self;
        done.cancel();
        for persister in persisters {
            if let Err(err) = persister.await {
                error!(error = %err, "sink persister failed");
            }
        }
        drop(handle);
        info!("study database sink closed");
    }
}

/// One background persister. Exits on the done pulse (after flushing what
/// is buffered), on channel closure, or immediately on the root token.
fn spawn_persister<T, F>(
    name: &'static str,
    mut rx: mpsc::Receiver<T>,
    pool: Pool<SqliteConnectionManager>,
    done: CancellationToken,
    cancel: CancellationToken,
    write: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(&Connection, &T) -> Result<(), SinkError> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        // Failed inserts are logged and dropped; the study is observational
        // and must outlive a lost row.
        let persist_one = |item: &T| {
            let conn = match pool.get() {
                Ok(conn) => conn,
                Err(err) => {
                    error!(persister = name, error = %err, "no connection available, dropping row");
                    return;
                }
            };
            if let Err(err) = write(&conn, item) {
                error!(persister = name, error = %err, "insert failed, dropping row");
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(persister = name, "shutdown detected, closing persister");
                    return;
                }
                _ = done.cancelled() => {
                    while let Ok(item) = rx.try_recv() {
                        persist_one(&item);
                    }
                    debug!(persister = name, "finish detected, closing persister");
                    return;
                }
                item = rx.recv() => {
                    let Some(item) = item else {
                        debug!(persister = name, "channel drained, closing persister");
                        return;
                    };
                    persist_one(&item);
                }
            }
        }
    })
}

fn init_tables(conn: &Connection) -> Result<(), SinkError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cid_info (
             cid TEXT PRIMARY KEY,
             creator TEXT NOT NULL,
             k INTEGER NOT NULL,
             prov_op TEXT NOT NULL,
             publication_time TEXT,
             provide_latency_ms INTEGER,
             req_interval_ms INTEGER NOT NULL,
             study_duration_ms INTEGER NOT NULL,
             pr_holder_count INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS peer_info (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             cid TEXT NOT NULL,
             peer_id TEXT NOT NULL,
             multiaddrs TEXT NOT NULL,
             user_agent TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS fetch_results (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             cid TEXT NOT NULL,
             round INTEGER NOT NULL,
             start_time TEXT NOT NULL,
             finish_time TEXT NOT NULL,
             is_retrievable INTEGER NOT NULL,
             total_hops INTEGER NOT NULL,
             hops_to_closest INTEGER NOT NULL,
             hops_tree_depth INTEGER NOT NULL,
             find_prov_duration_ms INTEGER NOT NULL,
             get_closest_peers_duration_ms INTEGER NOT NULL,
             closest_peers TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS ping_results (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             cid TEXT NOT NULL,
             peer_id TEXT NOT NULL,
             round INTEGER NOT NULL,
             ping_time TEXT NOT NULL,
             ping_duration_ms INTEGER NOT NULL,
             active INTEGER NOT NULL,
             has_records INTEGER NOT NULL,
             conn_error TEXT NOT NULL
         );",
    )
    .context(ExecuteSnafu)
}

fn duration_ms(duration: std::time::Duration) -> i64 {
    duration.as_millis() as i64
}

/// Hop columns keep the historical `-1` sentinel for "no instrumentation".
fn hops_column(hops: Option<usize>) -> i64 {
    hops.map(|h| h as i64).unwrap_or(-1)
}

fn insert_cid_info(conn: &Connection, info: &CidInfo) -> Result<(), SinkError> {
    debug!(cid = %info.key(), "persisting cid info");
    conn.execute(
        "INSERT OR REPLACE INTO cid_info
         (cid, creator, k, prov_op, publication_time, provide_latency_ms,
          req_interval_ms, study_duration_ms, pr_holder_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            info.key(),
            info.creator().to_string(),
            info.k() as i64,
            info.prov_op().as_str(),
            info.publication_time().map(|t| t.to_rfc3339()),
            info.provide_latency().map(duration_ms),
            duration_ms(info.req_interval()),
            duration_ms(info.study_duration()),
            info.holder_count() as i64,
        ],
    )
    .context(ExecuteSnafu)?;
    Ok(())
}

fn insert_peer_info(conn: &Connection, cid: &Cid, peer: &PeerInfo) -> Result<(), SinkError> {
    let multiaddrs: Vec<String> = peer.multiaddrs.iter().map(|a| a.to_string()).collect();
    let multiaddrs = serde_json::to_string(&multiaddrs).context(SerializeColumnSnafu)?;
    conn.execute(
        "INSERT INTO peer_info (cid, peer_id, multiaddrs, user_agent)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            cid.to_string(),
            peer.peer_id.to_string(),
            multiaddrs,
            peer.user_agent,
        ],
    )
    .context(ExecuteSnafu)?;
    Ok(())
}

fn insert_fetch_results(conn: &Connection, fetch: &CidFetchResults) -> Result<(), SinkError> {
    let closest: Vec<String> = fetch.closest_peers.iter().map(|p| p.to_string()).collect();
    let closest = serde_json::to_string(&closest).context(SerializeColumnSnafu)?;
    conn.execute(
        "INSERT INTO fetch_results
         (cid, round, start_time, finish_time, is_retrievable, total_hops,
          hops_to_closest, hops_tree_depth, find_prov_duration_ms,
          get_closest_peers_duration_ms, closest_peers)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            fetch.cid.to_string(),
            fetch.round as i64,
            fetch.start_time.to_rfc3339(),
            fetch.finish_time.to_rfc3339(),
            fetch.is_retrievable,
            hops_column(fetch.total_hops),
            hops_column(fetch.hops_to_closest),
            hops_column(fetch.hops_tree_depth),
            duration_ms(fetch.find_prov_duration),
            duration_ms(fetch.get_closest_peers_duration),
            closest,
        ],
    )
    .context(ExecuteSnafu)?;
    Ok(())
}

fn insert_ping_results(conn: &Connection, pings: &[PrPingResult]) -> Result<(), SinkError> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO ping_results
             (cid, peer_id, round, ping_time, ping_duration_ms, active,
              has_records, conn_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .context(ExecuteSnafu)?;
    for ping in pings {
        stmt.execute(params![
            ping.cid.to_string(),
            ping.peer_id.to_string(),
            ping.round as i64,
            ping.ping_time.to_rfc3339(),
            duration_ms(ping.ping_duration),
            ping.active,
            ping.has_records,
            ping.conn_error.as_str(),
        ])
        .context(ExecuteSnafu)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvideOp;
    use crate::host::ConnError;
    use chrono::Utc;
    use libp2p_identity::PeerId;
    use multihash_codetable::{Code, MultihashDigest};
    use std::time::Duration;

    fn sample_cid(seed: u8) -> Cid {
        Cid::new_v1(0x55, Code::Sha2_256.digest(&[seed]))
    }

    fn count_rows(path: &Path, table: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    fn sample_ping(cid: Cid, round: usize) -> PrPingResult {
        PrPingResult {
            cid,
            peer_id: PeerId::random(),
            round,
            ping_time: Utc::now(),
            ping_duration: Duration::from_millis(40),
            active: true,
            has_records: false,
            conn_error: ConnError::None,
        }
    }

    #[tokio::test]
    async fn every_record_kind_lands_in_its_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.db");
        let sink = DbSink::open(&path, CancellationToken::new()).unwrap();
        let handle = sink.handle();

        let cid = sample_cid(1);
        let info = Arc::new(CidInfo::new(
            cid,
            PeerId::random(),
            20,
            ProvideOp::Standard,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        info.set_publication(Utc::now(), Duration::from_millis(900));

        handle.add_cid_info(info).await;
        handle
            .add_peer_info(
                cid,
                PeerInfo::new(
                    PeerId::random(),
                    vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
                    "kubo/0.32".into(),
                ),
            )
            .await;
        handle
            .add_fetch_results(Arc::new(CidFetchResults {
                cid,
                round: 0,
                start_time: Utc::now(),
                finish_time: Utc::now(),
                is_retrievable: true,
                total_hops: Some(5),
                hops_to_closest: None,
                hops_tree_depth: Some(3),
                find_prov_duration: Duration::from_millis(120),
                get_closest_peers_duration: Duration::ZERO,
                closest_peers: vec![PeerId::random()],
                pr_ping_results: Vec::new(),
            }))
            .await;
        handle
            .add_ping_results(vec![sample_ping(cid, 0), sample_ping(cid, 0)])
            .await;

        drop(handle);
        sink.close().await;

        assert_eq!(count_rows(&path, "cid_info"), 1);
        assert_eq!(count_rows(&path, "peer_info"), 1);
        assert_eq!(count_rows(&path, "fetch_results"), 1);
        assert_eq!(count_rows(&path, "ping_results"), 2);

        // None hops keep the -1 sentinel.
        let conn = Connection::open(&path).unwrap();
        let to_closest: i64 = conn
            .query_row("SELECT hops_to_closest FROM fetch_results", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(to_closest, -1);
    }

    #[tokio::test]
    async fn tiny_capacity_applies_backpressure_without_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.db");
        let sink = DbSink::open_with_capacity(&path, 1, CancellationToken::new()).unwrap();
        let handle = sink.handle();

        let mut producers = Vec::new();
        for seed in 0..32u8 {
            let handle = handle.clone();
            producers.push(tokio::spawn(async move {
                handle
                    .add_ping_results(vec![sample_ping(sample_cid(seed), 1)])
                    .await;
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        drop(handle);
        sink.close().await;
        assert_eq!(count_rows(&path, "ping_results"), 32);
    }

    #[tokio::test]
    async fn cancelled_sink_drops_buffered_rows_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.db");
        let cancel = CancellationToken::new();
        let sink = DbSink::open(&path, cancel.clone()).unwrap();
        let handle = sink.handle();

        cancel.cancel();
        // The persisters may already be gone; the send must not wedge.
        handle.add_ping_results(vec![sample_ping(sample_cid(1), 1)]).await;

        drop(handle);
        sink.close().await;
    }

    #[tokio::test]
    async fn empty_ping_batch_is_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.db");
        let sink = DbSink::open(&path, CancellationToken::new()).unwrap();
        let handle = sink.handle();

        handle.add_ping_results(Vec::new()).await;

        drop(handle);
        sink.close().await;
        assert_eq!(count_rows(&path, "ping_results"), 0);
    }
}
