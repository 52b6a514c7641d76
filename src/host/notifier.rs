use std::time::Duration;

use chrono::{DateTime, Utc};
use libp2p_identity::PeerId;
use tokio::sync::broadcast;

use crate::host::DialError;

/// Buffered events per subscriber before the oldest are dropped.
const NOTIFIER_CAPACITY: usize = 1024;

/// Low-level DHT message kinds a host may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    AddProvider,
    GetProviders,
    PutValue,
    GetValue,
    FindNode,
    Ping,
}

/// One outbound DHT message observed by the host's send hook.
#[derive(Debug, Clone)]
pub struct MsgNotification {
    pub msg_type: MsgType,
    pub remote_peer: PeerId,
    /// Raw record key of the message; for ADD_PROVIDER this is the CID bytes.
    pub key: Vec<u8>,
    pub query_time: DateTime<Utc>,
    pub query_duration: Duration,
    /// `None` when the remote accepted the message.
    pub error: Option<DialError>,
}

/// Best-effort fan-out of DHT message events.
///
/// Built on a broadcast channel: a subscriber that falls more than
/// `NOTIFIER_CAPACITY` events behind loses the oldest ones and observes a
/// lag, but the host is never stalled by a slow subscriber.
#[derive(Debug)]
pub struct MsgNotifier {
    tx: broadcast::Sender<MsgNotification>,
}

impl MsgNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFIER_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MsgNotification> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers. An event with no
    /// subscribers is silently dropped.
    pub fn notify(&self, notification: MsgNotification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for MsgNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(msg_type: MsgType) -> MsgNotification {
        MsgNotification {
            msg_type,
            remote_peer: PeerId::random(),
            key: vec![0x01],
            query_time: Utc::now(),
            query_duration: Duration::from_millis(3),
            error: None,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let notifier = MsgNotifier::new();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.notify(notification(MsgType::AddProvider));
        notifier.notify(notification(MsgType::Ping));

        assert_eq!(a.recv().await.unwrap().msg_type, MsgType::AddProvider);
        assert_eq!(a.recv().await.unwrap().msg_type, MsgType::Ping);
        assert_eq!(b.recv().await.unwrap().msg_type, MsgType::AddProvider);
        assert_eq!(b.recv().await.unwrap().msg_type, MsgType::Ping);
    }

    #[test]
    fn notify_without_subscribers_does_not_panic() {
        let notifier = MsgNotifier::new();
        notifier.notify(notification(MsgType::AddProvider));
    }
}
