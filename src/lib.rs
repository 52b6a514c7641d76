//! cidwatch: a measurement harness for the content-routing layer of a
//! content-addressed peer-to-peer network.
//!
//! The harness publishes a controlled population of CIDs into a
//! Kademlia-style DHT, records which remote peers accepted provider records
//! (and with what latency), then repeatedly re-probes those PR holders over
//! the lifetime of the study: is the holder still reachable, does it still
//! have the record, is the content still findable through a normal lookup?
//! Every observation lands in a local SQLite dataset.
//!
//! The crate is the orchestration engine only. The DHT host itself
//! (bootstrap, wire protocol, lookups, the `Provide` RPC) is an external
//! collaborator consumed through [`host::DhtHost`]; command-line parsing and
//! the analytical side of the SQL schema live outside too.
//!
//! A run is assembled from a host, a database path, a CID source and a
//! [`StudyConfig`]:
//!
//! ```no_run
//! # async fn example(host: std::sync::Arc<dyn cidwatch::host::DhtHost>) -> anyhow::Result<()> {
//! use cidwatch::{Study, StudyConfig};
//! use cidwatch::source::RandomCidGen;
//!
//! let config = StudyConfig {
//!     k: 20,
//!     cid_number: 1000,
//!     rounds: 10,
//!     ..StudyConfig::default()
//! };
//! let mut study = Study::new(
//!     host,
//!     std::path::Path::new("./study.db"),
//!     Box::new(RandomCidGen::default()),
//!     config,
//! )?;
//! study.run().await?;
//! # Ok(())
//! # }
//! ```

/// Study parameters and validation.
pub mod config;
/// Durable sink: bounded channels feeding background SQLite persisters.
pub mod db;
/// Contract of the external DHT host, its event feed and error taxonomy.
pub mod host;
/// Tracked-CID data model.
pub mod models;
/// CID supply: random generation and JSON file replay.
pub mod source;
/// The engine: publisher, pinger, registry, queue and lifecycle controller.
pub mod study;

pub use config::{ProvideOp, StudyConfig};
pub use study::Study;
