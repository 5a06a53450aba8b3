//! Key to disk index.
//!
//! The index is a cache of which disk holds a key. The filesystem stays
//! authoritative; a stale entry is healed by the store on lookup.

use dashmap::DashMap;

use crate::placement::DiskId;
use crate::Result;

/// Persistent or in-memory key → disk mapping.
///
/// Implementations must be safe to share between upload workers.
pub trait DiskIndex: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<DiskId>>;

    fn add(&self, key: &str, disk_id: DiskId) -> Result<()>;

    /// Returns the disk the key pointed at, if any.
    fn remove(&self, key: &str) -> Result<Option<DiskId>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) -> Result<()>;
}

/// Lock-sharded in-memory index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: DashMap<String, DiskId>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiskIndex for MemoryIndex {
    fn get(&self, key: &str) -> Result<Option<DiskId>> {
        Ok(self.entries.get(key).map(|e| *e.value()))
    }

    fn add(&self, key: &str, disk_id: DiskId) -> Result<()> {
        self.entries.insert(key.to_string(), disk_id);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<DiskId>> {
        Ok(self.entries.remove(key).map(|(_, d)| d))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
