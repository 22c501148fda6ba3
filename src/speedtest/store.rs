//! Result persistence seam.

use std::cell::RefCell;

/// Sink for finished measurements. Saving is fire-and-forget.
pub trait ResultStore {
    /// Persist `blob` under `category` for `client_id`.
    fn save(&self, category: &str, blob: &[u8], client_id: &str);
}

/// One saved record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    /// Record category, e.g. `speedtest`
    pub category: String,
    /// Serialized result
    pub blob: Vec<u8>,
    /// Agent that produced it
    pub client_id: String,
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RefCell<Vec<StoredResult>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of saved records
    pub fn records(&self) -> Vec<StoredResult> {
        self.records.borrow().clone()
    }

    /// Number of saved records
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    /// Whether nothing was saved
    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

impl ResultStore for MemoryStore {
    fn save(&self, category: &str, blob: &[u8], client_id: &str) {
        tracing::debug!("saving {} bytes of {} for {}", blob.len(), category, client_id);
        self.records.borrow_mut().push(StoredResult {
            category: category.to_string(),
            blob: blob.to_vec(),
            client_id: client_id.to_string(),
        });
    }
}
