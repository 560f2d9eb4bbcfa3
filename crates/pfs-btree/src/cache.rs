//! Bounded node cache.
//!
//! The cache lock only guards the resident map. Node reads happen with the
//! lock released: a miss looks up, drops the guard, reads from the inner
//! source and then re-locks to insert. Two threads missing on the same node
//! may both read it; the second insert simply refreshes the entry.

use crate::NodeSource;
use parking_lot::Mutex;
use pfs_error::{PfsError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct CacheState {
    resident: HashMap<u64, Arc<[u8]>>,
    /// Least recently used at the front.
    order: VecDeque<u64>,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn touch(&mut self, node: u64) {
        if let Some(pos) = self.order.iter().position(|&n| n == node) {
            self.order.remove(pos);
        }
        self.order.push_back(node);
    }
}

/// LRU map from node number to node bytes.
#[derive(Debug)]
pub struct NodeCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PfsError::Config("node cache capacity must be non-zero".into()));
        }
        Ok(Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn get(&self, node: u64) -> Option<Arc<[u8]>> {
        let mut guard = self.state.lock();
        match guard.resident.get(&node).cloned() {
            Some(bytes) => {
                guard.hits += 1;
                guard.touch(node);
                Some(bytes)
            }
            None => {
                guard.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, node: u64, bytes: Arc<[u8]>) {
        let mut guard = self.state.lock();
        guard.resident.insert(node, bytes);
        guard.touch(node);
        while guard.resident.len() > self.capacity {
            let Some(victim) = guard.order.pop_front() else {
                break;
            };
            guard.resident.remove(&victim);
            trace!(node = victim, "node cache evict");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().resident.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        let guard = self.state.lock();
        (guard.hits, guard.misses)
    }
}

/// A [`NodeSource`] that serves repeated reads from a [`NodeCache`].
#[derive(Debug)]
pub struct CachedNodeSource<S> {
    inner: S,
    cache: NodeCache,
}

impl<S: NodeSource> CachedNodeSource<S> {
    pub fn new(inner: S, capacity: usize) -> Result<Self> {
        Ok(Self {
            inner,
            cache: NodeCache::new(capacity)?,
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }
}

impl<S: NodeSource> NodeSource for CachedNodeSource<S> {
    fn read_node(&self, node: u64) -> Result<Arc<[u8]>> {
        if let Some(bytes) = self.cache.get(node) {
            return Ok(bytes);
        }
        let bytes = self.inner.read_node(node)?;
        self.cache.insert(node, Arc::clone(&bytes));
        Ok(bytes)
    }

    fn node_count(&self) -> u64 {
        self.inner.node_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemNodeSource, build_abtb, records};
    use crate::{BTree, ShortFormFormat};
    use std::ops::ControlFlow;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(NodeCache::new(0), Err(PfsError::Config(_))));
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = NodeCache::new(2).expect("cache");
        cache.insert(1, Arc::from(vec![1_u8]));
        cache.insert(2, Arc::from(vec![2_u8]));
        assert!(cache.get(1).is_some());
        cache.insert(3, Arc::from(vec![3_u8]));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_none());
        assert_eq!(cache.get(1).as_deref(), Some(&[1_u8][..]));
        assert_eq!(cache.get(3).as_deref(), Some(&[3_u8][..]));
        assert_eq!(cache.stats(), (3, 1));
    }

    #[test]
    fn repeated_lookups_hit_the_cache() {
        let (nodes, root) = build_abtb(&records(100), 64);
        let source = CachedNodeSource::new(MemNodeSource::new(nodes), 64).expect("source");
        let tree = BTree::new(ShortFormFormat::by_block(64), source, Some(u64::from(root)));
        let key = records(100)[40];

        assert_eq!(tree.lookup(&key).expect("first"), Some(key));
        let cold = tree.source().inner().reads();
        assert_eq!(cold, 4);
        assert_eq!(tree.lookup(&key).expect("second"), Some(key));
        assert_eq!(tree.source().inner().reads(), cold);

        let scanned = tree
            .scan_all(|_, _| ControlFlow::Continue(()))
            .expect("scan");
        assert_eq!(scanned, 100);
    }

    #[test]
    fn shared_across_threads() {
        let (nodes, root) = build_abtb(&records(200), 128);
        let source = CachedNodeSource::new(MemNodeSource::new(nodes), 8).expect("source");
        let tree = Arc::new(BTree::new(
            ShortFormFormat::by_block(128),
            source,
            Some(u64::from(root)),
        ));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tree = Arc::clone(&tree);
                std::thread::spawn(move || {
                    for rec in records(200).iter().skip(t).step_by(4) {
                        assert_eq!(tree.lookup(rec).expect("lookup"), Some(*rec));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert!(tree.source().cache().len() <= 8);
    }
}
