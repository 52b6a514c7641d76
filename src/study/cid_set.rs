use std::sync::Arc;

use dashmap::DashMap;

use crate::models::CidInfo;

/// Process-wide registry of tracked CIDs.
///
/// Keys are the canonical string form of the CID (`Cid::to_string()`), the
/// same form externally-serialized records carry. Entries are never evicted;
/// a CID stays tracked for the whole study.
#[derive(Debug, Default)]
pub struct CidSet {
    inner: DashMap<String, Arc<CidInfo>>,
}

impl CidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the key is already tracked. Returns false on a
    /// duplicate, leaving the existing entry untouched.
    pub fn insert_if_absent(&self, info: Arc<CidInfo>) -> bool {
        match self.inner.entry(info.key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(info);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<CidInfo>> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
