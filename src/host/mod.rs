//! Contract of the external DHT host.
//!
//! The low-level Kademlia machinery (bootstrapping, wire encoding, lookup,
//! the `Provide` RPC) lives outside this crate behind [`DhtHost`]. The
//! harness only needs the operations below plus the [`MsgNotifier`] event
//! feed; integration tests drive the engine with a deterministic in-memory
//! implementation of the same trait.

mod error;
mod notifier;

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use std::time::Duration;

pub use error::{ConnError, DialError};
pub use notifier::{MsgNotification, MsgNotifier, MsgType};

/// A peer and the addresses it can be dialed on.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub multiaddrs: Vec<Multiaddr>,
}

/// Hop accounting for a closest-peers walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hops {
    pub total: usize,
    pub to_closest: usize,
}

/// Instrumentation captured by the host during a `provide` lookup.
#[derive(Debug, Clone)]
pub struct LookupMetrics {
    pub total_hops: usize,
    pub tree_depth: usize,
    pub min_hops_to_closest: usize,
    pub closest_peers: Vec<PeerId>,
}

/// Operations the harness consumes from a DHT host.
///
/// Long-running calls are cancelled by dropping their futures; callers race
/// them against the study's cancellation token.
#[async_trait]
pub trait DhtHost: Send + Sync {
    /// Identity of the local peer.
    fn id(&self) -> PeerId;

    /// Event feed of outbound DHT messages. For every ADD_PROVIDER RPC
    /// issued during [`DhtHost::provide`] the host emits one
    /// [`MsgNotification`], successful or not.
    fn msg_notifier(&self) -> &MsgNotifier;

    /// Publish provider records for `cid` to the closest peers. Returns the
    /// total provide latency and, when available, lookup instrumentation.
    async fn provide(&self, cid: &Cid) -> Result<(Duration, Option<LookupMetrics>)>;

    /// Fresh DHT lookup for providers of `cid`.
    async fn lookup_providers(&self, cid: &Cid) -> Result<Vec<AddrInfo>>;

    /// Walk towards `key`, returning the closest peers found and the hop
    /// accounting of the walk.
    async fn closest_peers(&self, key: &[u8]) -> Result<(Vec<PeerId>, Hops)>;

    /// Ask one specific peer for the providers it stores under `key`.
    async fn providers_from_peer(&self, peer: PeerId, key: &[u8]) -> Result<Vec<AddrInfo>>;

    /// Dial a peer on its known addresses.
    async fn connect(&self, target: &AddrInfo) -> Result<(), DialError>;

    /// Drop the connection to a peer.
    async fn close_peer(&self, peer: PeerId) -> Result<()>;

    /// Addresses currently known for a peer, from the host's peerstore.
    fn multiaddrs_of_peer(&self, peer: PeerId) -> Vec<Multiaddr>;

    /// User agent observed for a peer during identify, if any.
    fn user_agent_of_peer(&self, peer: PeerId) -> Option<String>;

    /// Shut the host down.
    async fn close(&self) -> Result<()>;
}
