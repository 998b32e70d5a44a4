//! LRU cache of raster blocks
//!
//! Fixed-capacity cache mapping a linear block index to an owned block
//! buffer. Eviction hands the displaced entry back to the caller, which is
//! responsible for flushing dirty blocks; the cache itself never performs
//! I/O.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Default number of blocks a managed raster keeps resident
pub const DEFAULT_CACHE_BLOCKS: usize = 64;

/// LRU cache of block buffers keyed by linear block index.
pub struct BlockCache {
    inner: LruCache<usize, Vec<f64>>,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: LruCache::new(cap),
        }
    }

    /// Whether the block is resident, without touching recency.
    pub fn contains(&self, block_index: usize) -> bool {
        self.inner.contains(&block_index)
    }

    /// Borrow a resident block mutably, marking it most recently used.
    pub fn get_mut(&mut self, block_index: usize) -> Option<&mut Vec<f64>> {
        self.inner.get_mut(&block_index)
    }

    /// Borrow a resident block without touching recency.
    pub fn peek(&self, block_index: usize) -> Option<&Vec<f64>> {
        self.inner.peek(&block_index)
    }

    /// Insert a block, returning the evicted `(index, buffer)` entry when
    /// the capacity was exceeded.
    pub fn put(&mut self, block_index: usize, buffer: Vec<f64>) -> Option<(usize, Vec<f64>)> {
        self.inner.push(block_index, buffer)
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drain every resident block in eviction (least-recent-first) order.
    pub fn drain(&mut self) -> Vec<(usize, Vec<f64>)> {
        let mut entries = Vec::with_capacity(self.inner.len());
        while let Some(entry) = self.inner.pop_lru() {
            entries.push(entry);
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_put_get() {
        let mut cache = BlockCache::new(4);
        assert!(cache.put(7, vec![1.0, 2.0]).is_none());
        assert!(cache.contains(7));
        assert_eq!(cache.get_mut(7), Some(&mut vec![1.0, 2.0]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_eviction_returns_lru_entry() {
        let mut cache = BlockCache::new(2);
        cache.put(0, vec![0.0]);
        cache.put(1, vec![1.0]);
        // touch block 0 so block 1 is least recently used
        cache.get_mut(0);
        let evicted = cache.put(2, vec![2.0]);
        assert_eq!(evicted, Some((1, vec![1.0])));
        assert!(cache.contains(0));
        assert!(cache.contains(2));
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_cache_never_exceeds_capacity() {
        let mut cache = BlockCache::new(3);
        for block_index in 0..100 {
            cache.put(block_index, vec![block_index as f64]);
            assert!(cache.len() <= 3);
        }
    }

    #[test]
    fn test_drain_yields_in_eviction_order() {
        let mut cache = BlockCache::new(3);
        cache.put(10, vec![]);
        cache.put(11, vec![]);
        cache.put(12, vec![]);
        cache.get_mut(10);
        let order: Vec<usize> = cache.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec![11, 12, 10]);
        assert!(cache.is_empty());
    }
}
