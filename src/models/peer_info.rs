use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

use crate::host::AddrInfo;

/// Snapshot of a PR holder as observed at discovery time.
///
/// The multiaddresses and user agent are frozen when the holder first
/// acknowledges an ADD_PROVIDER message; later rounds dial the holder on
/// exactly this snapshot.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub multiaddrs: Vec<Multiaddr>,
    pub user_agent: String,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, multiaddrs: Vec<Multiaddr>, user_agent: String) -> Self {
        Self {
            peer_id,
            multiaddrs,
            user_agent,
        }
    }

    /// Dialable view of this holder.
    pub fn addr_info(&self) -> AddrInfo {
        AddrInfo {
            peer_id: self.peer_id,
            multiaddrs: self.multiaddrs.clone(),
        }
    }
}
