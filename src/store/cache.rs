use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru_time_cache::LruCache;

use crate::block::{BlockId, BlockIndex, BlockMeta, SeriesEntry};
use crate::error::{VaultError, VaultResult};
use crate::objstore::ObjectBucket;

/// Shared LRU of decoded block indexes, keyed by block id.
///
/// Population happens outside the lock: concurrent misses on the same block
/// may both fetch, and the later insert wins. Readers never wait for a fetch.
pub struct IndexCache {
    requests: AtomicU64,
    misses: AtomicU64,
    inner: Mutex<LruCache<BlockId, Arc<BlockIndex>>>,
}

impl IndexCache {
    pub fn new(capacity: usize) -> IndexCache {
        IndexCache {
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inner: Mutex::new(LruCache::with_capacity(capacity)),
        }
    }

    pub fn get(&self, id: &BlockId) -> Option<Arc<BlockIndex>> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.get(id);
        if item.is_some() {
            self.requests.fetch_add(1, Ordering::Relaxed);
            Some(item?.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn insert(&self, id: BlockId, index: Arc<BlockIndex>) {
        self.inner.lock().unwrap().insert(id, index);
    }

    /// Cached index for the block, fetching and decoding the artifact on a
    /// miss.
    pub async fn get_or_load(
        &self,
        bucket: &dyn ObjectBucket,
        meta: &BlockMeta,
    ) -> VaultResult<Arc<BlockIndex>> {
        if let Some(index) = self.get(&meta.id) {
            return Ok(index);
        }

        let bytes = bucket.get(&meta.id.index_path()).await?;
        let series: Vec<SeriesEntry> = serde_json::from_slice(&bytes).map_err(|e| {
            VaultError::InvalidBlock(meta.id.to_string(), format!("bad index artifact: {e}"))
        })?;
        let index = Arc::new(BlockIndex::new(meta.clone(), series)?);
        tracing::debug!(
            "loaded index of block {}: {} series, ~{} bytes resident",
            meta.id,
            index.num_series(),
            index.approx_size()
        );
        self.insert(meta.id, index.clone());
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
