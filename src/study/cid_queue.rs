use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::CidInfo;

/// Time-ordered queue of tracked CIDs, keyed by their next due instant.
///
/// The pinger orchestrator is the only reader; all mutation goes through
/// this API so that sort and removal always see a consistent map/list pair.
/// At the expected population (10^3..10^4 CIDs) a sort-after-pass flat list
/// beats a heap that would need arbitrary removal.
#[derive(Debug, Default)]
pub struct CidQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    by_key: HashMap<String, Arc<CidInfo>>,
    ordered: Vec<Arc<CidInfo>>,
}

impl CidQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, info: Arc<CidInfo>) {
        let mut inner = self.inner.lock();
        let key = info.key();
        if inner.by_key.insert(key, info.clone()).is_some() {
            // Already queued; the list entry is the same Arc.
            return;
        }
        inner.ordered.push(info);
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.by_key.remove(key).is_none() {
            return;
        }
        inner.ordered.retain(|c| c.key() != key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ordered.is_empty()
    }

    /// Sort ascending by next due instant.
    pub fn sort(&self) {
        let mut inner = self.inner.lock();
        inner.ordered.sort_by_key(|c| c.next_ping());
    }

    /// Clone of the list in its current order. Call [`CidQueue::sort`]
    /// first to walk in due order.
    pub fn snapshot(&self) -> Vec<Arc<CidInfo>> {
        self.inner.lock().ordered.clone()
    }
}
