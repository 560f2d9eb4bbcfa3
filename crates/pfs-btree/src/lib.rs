#![forbid(unsafe_code)]
//! Read-only B-tree traversal.
//!
//! The engine knows nothing about any particular on-disk layout. A
//! [`TreeFormat`] supplies four independent decoders (node header, leaf
//! record, interior record, key comparison) and a [`NodeSource`] supplies
//! raw node bytes by node number. [`BTree`] combines the two into point
//! lookups and ordered scans along the leaf sibling chain.
//!
//! Levels count up from the leaves: every leaf is level 0 and a child is
//! always exactly one level below its parent. Trees deeper than
//! [`MAX_TREE_DEPTH`] are rejected as corrupt.

mod cache;
pub mod short_form;

use pfs_error::{PfsError, Result};
use pfs_types::ParseError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{error, trace};

pub use cache::{CachedNodeSource, NodeCache};
pub use short_form::{AllocOrder, BlockNodeSource, ShortFormFormat};

/// Deepest tree accepted, counted in levels above the leaves.
pub const MAX_TREE_DEPTH: u16 = 16;

/// Format-independent node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeHeader {
    /// 0 for leaves.
    pub level: u16,
    pub record_count: u16,
    pub left_sibling: Option<u64>,
    pub right_sibling: Option<u64>,
}

impl BTreeHeader {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Decoders for one on-disk B-tree layout.
///
/// Decoders are pure: they see only the bytes of one node and report
/// layout violations as [`ParseError`]s, which the engine attributes to the
/// node being decoded.
pub trait TreeFormat: Send + Sync {
    type Key;
    type Value;

    fn parse_header(&self, node: &[u8]) -> std::result::Result<BTreeHeader, ParseError>;

    fn leaf_record(
        &self,
        node: &[u8],
        header: &BTreeHeader,
        index: usize,
    ) -> std::result::Result<(Self::Key, Self::Value), ParseError>;

    /// Key and child node number of interior record `index`.
    fn index_record(
        &self,
        node: &[u8],
        header: &BTreeHeader,
        index: usize,
    ) -> std::result::Result<(Self::Key, u64), ParseError>;

    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;
}

/// Supplies raw node bytes by node number.
pub trait NodeSource: Send + Sync {
    fn read_node(&self, node: u64) -> Result<Arc<[u8]>>;

    /// Number of addressable nodes; bounds sibling walks.
    fn node_count(&self) -> u64;
}

impl<S: NodeSource + ?Sized> NodeSource for Arc<S> {
    fn read_node(&self, node: u64) -> Result<Arc<[u8]>> {
        (**self).read_node(node)
    }

    fn node_count(&self) -> u64 {
        (**self).node_count()
    }
}

/// A B-tree rooted at a known node.
#[derive(Debug)]
pub struct BTree<F, S> {
    format: F,
    source: S,
    root: Option<u64>,
}

struct LoadedNode {
    number: u64,
    bytes: Arc<[u8]>,
    header: BTreeHeader,
}

impl<F: TreeFormat, S: NodeSource> BTree<F, S> {
    /// `root` is `None` for an empty tree.
    pub fn new(format: F, source: S, root: Option<u64>) -> Self {
        Self {
            format,
            source,
            root,
        }
    }

    pub fn format(&self) -> &F {
        &self.format
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    #[must_use]
    pub fn root(&self) -> Option<u64> {
        self.root
    }

    fn load(&self, number: u64, expected_level: Option<u16>) -> Result<LoadedNode> {
        let bytes = self.source.read_node(number)?;
        let header = self
            .format
            .parse_header(&bytes)
            .map_err(|err| PfsError::from_parse(number, &err))?;
        if header.level > MAX_TREE_DEPTH {
            error!(node = number, level = header.level, "btree: level exceeds depth bound");
            return Err(PfsError::corruption(
                number,
                format!("node level {} exceeds {MAX_TREE_DEPTH}", header.level),
            ));
        }
        if let Some(expected) = expected_level {
            if header.level != expected {
                error!(
                    node = number,
                    expected,
                    got = header.level,
                    "btree: level mismatch"
                );
                return Err(PfsError::corruption(
                    number,
                    format!("expected level {expected}, found {}", header.level),
                ));
            }
        }
        trace!(
            node = number,
            level = header.level,
            records = header.record_count,
            "btree: node"
        );
        Ok(LoadedNode {
            number,
            bytes,
            header,
        })
    }

    fn leaf_at(&self, node: &LoadedNode, index: usize) -> Result<(F::Key, F::Value)> {
        self.format
            .leaf_record(&node.bytes, &node.header, index)
            .map_err(|err| PfsError::from_parse(node.number, &err))
    }

    fn index_at(&self, node: &LoadedNode, index: usize) -> Result<(F::Key, u64)> {
        self.format
            .index_record(&node.bytes, &node.header, index)
            .map_err(|err| PfsError::from_parse(node.number, &err))
    }

    /// Number of leading records in `node` for which `keep(key)` holds.
    /// Records are sorted, so `keep` must be true for a prefix only.
    fn partition_point(
        &self,
        node: &LoadedNode,
        mut keep: impl FnMut(&F::Key) -> bool,
    ) -> Result<usize> {
        let (mut lo, mut hi) = (0_usize, usize::from(node.header.record_count));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let key = if node.header.is_leaf() {
                self.leaf_at(node, mid)?.0
            } else {
                self.index_at(node, mid)?.0
            };
            if keep(&key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Descend to the leaf that would hold `key`.
    ///
    /// Returns `None` when `key` sorts before every key in the tree and
    /// `clamp_left` is false.
    fn descend(&self, key: &F::Key, clamp_left: bool) -> Result<Option<LoadedNode>> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let mut node = self.load(root, None)?;
        let mut steps = 0_u16;
        while !node.header.is_leaf() {
            steps += 1;
            if steps > MAX_TREE_DEPTH {
                return Err(PfsError::corruption(node.number, "descent exceeds depth bound"));
            }
            if node.header.record_count == 0 {
                return Err(PfsError::corruption(node.number, "interior node has no records"));
            }
            let pos = self.partition_point(&node, |k| {
                self.format.compare(k, key) != Ordering::Greater
            })?;
            let slot = match pos {
                0 if clamp_left => 0,
                0 => return Ok(None),
                n => n - 1,
            };
            let (_, child) = self.index_at(&node, slot)?;
            node = self.load(child, Some(node.header.level - 1))?;
        }
        Ok(Some(node))
    }

    /// Point lookup. O(levels) node reads.
    pub fn lookup(&self, key: &F::Key) -> Result<Option<F::Value>> {
        let Some(leaf) = self.descend(key, false)? else {
            return Ok(None);
        };
        let pos = self.partition_point(&leaf, |k| {
            self.format.compare(k, key) != Ordering::Greater
        })?;
        if pos == 0 {
            return Ok(None);
        }
        let (found, value) = self.leaf_at(&leaf, pos - 1)?;
        Ok((self.format.compare(&found, key) == Ordering::Equal).then_some(value))
    }

    /// Leftmost leaf, reached through the first record of each level.
    fn leftmost_leaf(&self) -> Result<Option<LoadedNode>> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let mut node = self.load(root, None)?;
        while !node.header.is_leaf() {
            if node.header.record_count == 0 {
                return Err(PfsError::corruption(node.number, "interior node has no records"));
            }
            let (_, child) = self.index_at(&node, 0)?;
            node = self.load(child, Some(node.header.level - 1))?;
        }
        Ok(Some(node))
    }

    /// Visit every record in key order by walking the leaf sibling chain.
    ///
    /// Returns the number of records passed to `visitor`.
    pub fn scan_all<V>(&self, visitor: V) -> Result<usize>
    where
        V: FnMut(F::Key, F::Value) -> ControlFlow<()>,
    {
        let Some(first) = self.leftmost_leaf()? else {
            return Ok(0);
        };
        if let Some(left) = first.header.left_sibling {
            return Err(PfsError::corruption(
                first.number,
                format!("leftmost leaf has left sibling {left}"),
            ));
        }
        self.walk_leaves(first, 0, visitor)
    }

    /// Visit records in key order starting at the first key not less than
    /// `key`, until the visitor breaks or the tree ends.
    pub fn scan_from<V>(&self, key: &F::Key, visitor: V) -> Result<usize>
    where
        V: FnMut(F::Key, F::Value) -> ControlFlow<()>,
    {
        let Some(leaf) = self.descend(key, true)? else {
            return Ok(0);
        };
        let start = self.partition_point(&leaf, |k| {
            self.format.compare(k, key) == Ordering::Less
        })?;
        self.walk_leaves(leaf, start, visitor)
    }

    fn walk_leaves<V>(&self, first: LoadedNode, start: usize, mut visitor: V) -> Result<usize>
    where
        V: FnMut(F::Key, F::Value) -> ControlFlow<()>,
    {
        let limit = self.source.node_count();
        let mut visited = HashSet::from([first.number]);
        let mut node = first;
        let mut index = start;
        let mut count = 0_usize;

        loop {
            for i in index..usize::from(node.header.record_count) {
                let (key, value) = self.leaf_at(&node, i)?;
                count += 1;
                if visitor(key, value).is_break() {
                    return Ok(count);
                }
            }
            let Some(next) = node.header.right_sibling else {
                return Ok(count);
            };
            if !visited.insert(next) || visited.len() as u64 > limit {
                error!(node = node.number, next, "btree: leaf sibling cycle");
                return Err(PfsError::corruption(
                    node.number,
                    format!("leaf sibling chain revisits node {next}"),
                ));
            }
            let successor = self.load(next, Some(0))?;
            if successor.header.left_sibling != Some(node.number) {
                return Err(PfsError::corruption(
                    next,
                    format!(
                        "left sibling {:?} does not point back to {}",
                        successor.header.left_sibling, node.number
                    ),
                ));
            }
            node = successor;
            index = 0;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use pfs_ondisk::xfs::{
        ABTB_MAGIC, ALLOC_PTR_SIZE, ALLOC_REC_SIZE, NULL_AG_BLOCK, XfsAllocRec,
        XfsShortBlockHeader, interior_offsets, leaf_record_offset, maxrecs,
    };
    use pfs_types::write_be_u32;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Nodes held in memory, counting reads.
    #[derive(Debug, Default)]
    pub struct MemNodeSource {
        pub nodes: Vec<Arc<[u8]>>,
        pub reads: AtomicUsize,
    }

    impl MemNodeSource {
        pub fn new(nodes: Vec<Vec<u8>>) -> Self {
            Self {
                nodes: nodes.into_iter().map(Arc::from).collect(),
                reads: AtomicUsize::new(0),
            }
        }

        pub fn reads(&self) -> usize {
            self.reads.load(AtomicOrdering::Relaxed)
        }
    }

    impl NodeSource for MemNodeSource {
        fn read_node(&self, node: u64) -> Result<Arc<[u8]>> {
            self.reads.fetch_add(1, AtomicOrdering::Relaxed);
            usize::try_from(node)
                .ok()
                .and_then(|i| self.nodes.get(i))
                .cloned()
                .ok_or_else(|| PfsError::OutOfRange(format!("node {node}")))
        }

        fn node_count(&self) -> u64 {
            self.nodes.len() as u64
        }
    }

    fn sibling(nodes: &[u32], i: usize, forward: bool) -> u32 {
        let j = if forward { i.checked_add(1) } else { i.checked_sub(1) };
        j.and_then(|j| nodes.get(j)).copied().unwrap_or(NULL_AG_BLOCK)
    }

    /// Pack sorted records into a short-form ABTB tree. Returns the nodes
    /// and the root node number.
    pub fn build_abtb(records: &[XfsAllocRec], node_size: usize) -> (Vec<Vec<u8>>, u32) {
        let leaf_max = maxrecs(node_size, ALLOC_REC_SIZE);
        let interior_max = maxrecs(node_size, ALLOC_REC_SIZE + ALLOC_PTR_SIZE);
        let mut nodes: Vec<Vec<u8>> = Vec::new();

        let chunks: Vec<&[XfsAllocRec]> = if records.is_empty() {
            vec![records]
        } else {
            records.chunks(leaf_max).collect()
        };
        let numbers: Vec<u32> = (0..chunks.len())
            .map(|i| u32::try_from(i).expect("node number"))
            .collect();
        let mut level_entries: Vec<(XfsAllocRec, u32)> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut node = vec![0_u8; node_size];
            XfsShortBlockHeader {
                magic: ABTB_MAGIC,
                level: 0,
                numrecs: u16::try_from(chunk.len()).expect("numrecs"),
                leftsib: sibling(&numbers, i, false),
                rightsib: sibling(&numbers, i, true),
            }
            .write_into(&mut node)
            .expect("header");
            for (j, rec) in chunk.iter().enumerate() {
                rec.write_into(&mut node, leaf_record_offset(j, ALLOC_REC_SIZE))
                    .expect("record");
            }
            if let Some(first) = chunk.first() {
                level_entries.push((*first, numbers[i]));
            }
            nodes.push(node);
        }

        let mut level = 0_u16;
        let mut root = numbers[0];
        while level_entries.len() > 1 {
            level += 1;
            let groups: Vec<&[(XfsAllocRec, u32)]> = level_entries.chunks(interior_max).collect();
            let base = nodes.len();
            let numbers: Vec<u32> = (0..groups.len())
                .map(|i| u32::try_from(base + i).expect("node number"))
                .collect();
            let mut next = Vec::new();
            for (i, group) in groups.iter().enumerate() {
                let mut node = vec![0_u8; node_size];
                XfsShortBlockHeader {
                    magic: ABTB_MAGIC,
                    level,
                    numrecs: u16::try_from(group.len()).expect("numrecs"),
                    leftsib: sibling(&numbers, i, false),
                    rightsib: sibling(&numbers, i, true),
                }
                .write_into(&mut node)
                .expect("header");
                for (j, (key, child)) in group.iter().enumerate() {
                    let (key_at, ptr_at) =
                        interior_offsets(node_size, ALLOC_REC_SIZE, ALLOC_PTR_SIZE, j);
                    key.write_into(&mut node, key_at).expect("key");
                    write_be_u32(&mut node, ptr_at, *child).expect("ptr");
                }
                next.push((group[0].0, numbers[i]));
                nodes.push(node);
            }
            root = numbers[0];
            level_entries = next;
        }
        (nodes, root)
    }

    pub fn records(n: u32) -> Vec<XfsAllocRec> {
        (0..n)
            .map(|i| XfsAllocRec {
                startblock: i * 10 + 5,
                blockcount: i % 7 + 1,
            })
            .collect()
    }
}
