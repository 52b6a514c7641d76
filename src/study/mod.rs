//! The measurement engine: publication, scheduled re-probing, and the
//! lifecycle controller tying them to the sink and the host.
//!
//! # Architecture
//!
//! ```text
//! CidSource -> generator -> publisher workers -> DhtHost::provide
//!                  |               ^    \
//!                  |   ADD_PROVIDER|     -> CidSet / DbSink
//!                  |        listener
//!                  v
//!              CidPinger queue -> pinger workers -> holder probes
//!                                        \
//!                                         -> DbSink
//! ```
//!
//! Shutdown is staged outer-to-inner: the source channel closes, publisher
//! workers drain, the listener stops, the ping queue empties, workers drain
//! the task channel, the sink flushes, the host closes. Cancelling the root
//! token short-circuits every stage.

mod cid_queue;
mod cid_set;
mod pinger;
mod publisher;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StudyConfig;
use crate::db::DbSink;
use crate::host::DhtHost;
use crate::source::CidSource;

pub use cid_queue::CidQueue;
pub use cid_set::CidSet;
pub use pinger::{CidPinger, DIAL_GRACE_TIME, DIAL_TIMEOUT, MAX_DIAL_ATTEMPTS, MIN_ITER_TIME};
pub use publisher::CidPublisher;

/// One measurement run: publishes a population of CIDs and re-probes their
/// PR holders until every CID has completed its rounds.
pub struct Study {
    host: Arc<dyn DhtHost>,
    db: Option<DbSink>,
    cid_set: Arc<CidSet>,
    pinger: Arc<CidPinger>,
    publisher: CidPublisher,
    source: Option<Box<dyn CidSource>>,
    no_more_cids: CancellationToken,
    cancel: CancellationToken,
}

impl Study {
    /// Wire up the sink, pinger and publisher. Fails fast on a bad
    /// configuration or an unopenable database; nothing is running yet.
    pub fn new(
        host: Arc<dyn DhtHost>,
        db_path: &Path,
        source: Box<dyn CidSource>,
        config: StudyConfig,
    ) -> Result<Self> {
        config.validate().context("study configuration")?;

        let cancel = CancellationToken::new();
        let no_more_cids = CancellationToken::new();

        let db = DbSink::open_with_capacity(db_path, config.sink_capacity, cancel.clone())
            .context("opening study database")?;
        let cid_set = Arc::new(CidSet::new());
        let pinger = CidPinger::new(
            host.clone(),
            db.handle(),
            config.rounds,
            config.pinger_workers,
            no_more_cids.clone(),
            cancel.clone(),
        );
        let publisher = CidPublisher::new(
            host.clone(),
            db.handle(),
            cid_set.clone(),
            pinger.clone(),
            config,
            cancel.clone(),
        );

        Ok(Self {
            host,
            db: Some(db),
            cid_set,
            pinger,
            publisher,
            source: Some(source),
            no_more_cids,
            cancel,
        })
    }

    /// Token cancelling the whole run; hand it to a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registry of every CID tracked so far.
    pub fn cid_set(&self) -> Arc<CidSet> {
        self.cid_set.clone()
    }

    /// Run the study to completion (or until the token is cancelled).
    pub async fn run(&mut self) -> Result<()> {
        let source = self.source.take().context("study already ran")?;

        let pinger_task = tokio::spawn(self.pinger.clone().run());

        let publication = self.publisher.run(source).await;
        if publication.is_err() {
            // An invariant died in the publisher; take the rest down now.
            self.cancel.cancel();
        }

        // Publication is over: once the queue drains, the pinger stops.
        self.no_more_cids.cancel();
        let pinger_result = pinger_task.await;

        // Producers are gone; flush whatever they queued and close up.
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        if let Err(err) = self.host.close().await {
            warn!(error = %err, "failed closing dht host");
        }

        publication.context("publication failed")?;
        match pinger_result {
            Ok(result) => result?,
            Err(err) => return Err(anyhow!("ping orchestrator failed: {err}")),
        }

        info!(tracked = self.cid_set.len(), "study finished");
        Ok(())
    }

    /// Abort the run. A concurrent [`Study::run`] unwinds through its staged
    /// shutdown; buffered sink rows may be lost.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
