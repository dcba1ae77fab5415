//! Ids of records currently being written.
//!
//! While a write to a record is in flight its id is held here, and anything
//! that compares or polls records skips it so a half-visible write is not
//! mistaken for a conflicting change.

use dashmap::DashSet;
use std::sync::Arc;

/// Concurrency-safe "being written" set.
#[derive(Debug, Clone, Default)]
pub struct BeingWrittenSet {
    ids: Arc<DashSet<String>>,
}

impl BeingWrittenSet {
    /// Create an empty set. Clones share the same ids.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`. Returns `None` when another writer holds it.
    pub fn begin(&self, id: impl Into<String>) -> Option<WriteGuard> {
        let id = id.into();
        if self.ids.insert(id.clone()) {
            Some(WriteGuard {
                ids: Arc::clone(&self.ids),
                id,
            })
        } else {
            None
        }
    }

    /// Whether a writer currently holds `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Releases its id on drop.
#[derive(Debug)]
pub struct WriteGuard {
    ids: Arc<DashSet<String>>,
    id: String,
}

impl WriteGuard {
    /// The held id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}
