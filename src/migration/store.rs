//! Data-plane access to a node's storage during migration.

use crate::error::Result;
use crate::partitioning::HashRange;
use crate::storage::{RangeStats, StorageEngine, StorageEntry};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Range-level operations a migration needs from a node's storage.
///
/// Implemented directly by [`StorageEngine`] for the local node and by the
/// TCP transport for remote nodes.
#[async_trait::async_trait]
pub trait ShardDataStore: Send + Sync {
    /// Live key count and byte size of `range`.
    async fn range_stats(&self, range: HashRange) -> Result<RangeStats>;

    /// Reserve room for `bytes` of incoming data.
    async fn reserve(&self, bytes: u64) -> Result<()>;

    /// Return a reservation.
    async fn release(&self, bytes: u64) -> Result<()>;

    /// Entries of `range` in key order after `after`, about `max_bytes` worth.
    async fn read_chunk(
        &self,
        range: HashRange,
        after: Option<String>,
        max_bytes: u64,
    ) -> Result<Vec<StorageEntry>>;

    /// Store migrated entries; returns bytes written.
    async fn ingest(&self, entries: Vec<StorageEntry>) -> Result<u64>;

    /// Content checksum of `range`.
    async fn checksum(&self, range: HashRange) -> Result<u32>;

    /// Drop every entry of `range`; returns the number removed.
    async fn delete_range(&self, range: HashRange) -> Result<u64>;

    /// Make ingested or deleted data durable.
    async fn persist(&self) -> Result<()>;
}

#[async_trait::async_trait]
impl ShardDataStore for StorageEngine {
    async fn range_stats(&self, range: HashRange) -> Result<RangeStats> {
        Ok(StorageEngine::range_stats(self, range))
    }

    async fn reserve(&self, bytes: u64) -> Result<()> {
        Ok(StorageEngine::reserve(self, bytes)?)
    }

    async fn release(&self, bytes: u64) -> Result<()> {
        StorageEngine::release(self, bytes);
        Ok(())
    }

    async fn read_chunk(
        &self,
        range: HashRange,
        after: Option<String>,
        max_bytes: u64,
    ) -> Result<Vec<StorageEntry>> {
        Ok(StorageEngine::read_chunk(
            self,
            range,
            after.as_deref(),
            max_bytes,
        ))
    }

    async fn ingest(&self, entries: Vec<StorageEntry>) -> Result<u64> {
        Ok(StorageEngine::ingest(self, entries))
    }

    async fn checksum(&self, range: HashRange) -> Result<u32> {
        Ok(StorageEngine::checksum(self, range))
    }

    async fn delete_range(&self, range: HashRange) -> Result<u64> {
        Ok(StorageEngine::delete_range(self, range) as u64)
    }

    async fn persist(&self) -> Result<()> {
        self.compact()?;
        Ok(())
    }
}

/// Finds the data store of a node.
pub trait StoreResolver: Send + Sync {
    fn store(&self, node_id: &str) -> Option<Arc<dyn ShardDataStore>>;
}

/// A fixed table of stores, optionally backed by another resolver for
/// nodes not in the table.
#[derive(Default)]
pub struct StaticResolver {
    stores: RwLock<HashMap<NodeId, Arc<dyn ShardDataStore>>>,
    fallback: Option<Arc<dyn StoreResolver>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve unknown nodes through `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn StoreResolver>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Register (or replace) the store for a node.
    pub fn insert(&self, node_id: impl Into<NodeId>, store: Arc<dyn ShardDataStore>) {
        self.stores.write().insert(node_id.into(), store);
    }

    pub fn remove(&self, node_id: &str) -> bool {
        self.stores.write().remove(node_id).is_some()
    }
}

impl StoreResolver for StaticResolver {
    fn store(&self, node_id: &str) -> Option<Arc<dyn ShardDataStore>> {
        if let Some(store) = self.stores.read().get(node_id) {
            return Some(store.clone());
        }
        self.fallback.as_ref()?.store(node_id)
    }
}
