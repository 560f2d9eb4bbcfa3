//! XFS short-form free space B-trees (ABTB and ABTC) on top of the
//! generic engine, plus a node source that reads fixed-size nodes from a
//! block device.

use crate::{BTreeHeader, NodeSource, TreeFormat};
use pfs_block::{BlockDevice, read_bytes};
use pfs_error::{PfsError, Result};
use pfs_ondisk::xfs::{
    ABTB_MAGIC, ABTC_MAGIC, ALLOC_PTR_SIZE, ALLOC_REC_SIZE, XfsAllocRec, XfsShortBlockHeader,
    interior_offsets, leaf_record_offset, maxrecs,
};
use pfs_types::{ParseError, read_be_u32};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Key order of a free space tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOrder {
    /// ABTB: by starting block.
    ByBlock,
    /// ABTC: by block count, then starting block.
    ByCount,
}

/// Decoders for a free space B-tree with `node_size`-byte nodes.
#[derive(Debug, Clone, Copy)]
pub struct ShortFormFormat {
    order: AllocOrder,
    node_size: usize,
}

impl ShortFormFormat {
    #[must_use]
    pub fn by_block(node_size: usize) -> Self {
        Self {
            order: AllocOrder::ByBlock,
            node_size,
        }
    }

    #[must_use]
    pub fn by_count(node_size: usize) -> Self {
        Self {
            order: AllocOrder::ByCount,
            node_size,
        }
    }

    #[must_use]
    pub fn magic(&self) -> u32 {
        match self.order {
            AllocOrder::ByBlock => ABTB_MAGIC,
            AllocOrder::ByCount => ABTC_MAGIC,
        }
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }
}

impl TreeFormat for ShortFormFormat {
    type Key = XfsAllocRec;
    type Value = XfsAllocRec;

    fn parse_header(&self, node: &[u8]) -> std::result::Result<BTreeHeader, ParseError> {
        if node.len() < self.node_size {
            return Err(ParseError::OutOfRange {
                needed: self.node_size,
                offset: 0,
                actual: node.len(),
            });
        }
        let header = XfsShortBlockHeader::parse_with_magic(node, self.magic())?;
        let entry_len = if header.level == 0 {
            ALLOC_REC_SIZE
        } else {
            ALLOC_REC_SIZE + ALLOC_PTR_SIZE
        };
        if usize::from(header.numrecs) > maxrecs(self.node_size, entry_len) {
            return Err(ParseError::InvalidField {
                field: "bb_numrecs",
                reason: "exceeds node capacity",
            });
        }
        Ok(BTreeHeader {
            level: header.level,
            record_count: header.numrecs,
            left_sibling: header.left_sibling().map(u64::from),
            right_sibling: header.right_sibling().map(u64::from),
        })
    }

    fn leaf_record(
        &self,
        node: &[u8],
        _header: &BTreeHeader,
        index: usize,
    ) -> std::result::Result<(XfsAllocRec, XfsAllocRec), ParseError> {
        let rec = XfsAllocRec::parse(node, leaf_record_offset(index, ALLOC_REC_SIZE))?;
        Ok((rec, rec))
    }

    fn index_record(
        &self,
        node: &[u8],
        _header: &BTreeHeader,
        index: usize,
    ) -> std::result::Result<(XfsAllocRec, u64), ParseError> {
        let (key_at, ptr_at) =
            interior_offsets(self.node_size, ALLOC_REC_SIZE, ALLOC_PTR_SIZE, index);
        let key = XfsAllocRec::parse(node, key_at)?;
        let child = read_be_u32(node, ptr_at)?;
        Ok((key, u64::from(child)))
    }

    fn compare(&self, a: &XfsAllocRec, b: &XfsAllocRec) -> Ordering {
        match self.order {
            AllocOrder::ByBlock => a.startblock.cmp(&b.startblock),
            AllocOrder::ByCount => a
                .blockcount
                .cmp(&b.blockcount)
                .then(a.startblock.cmp(&b.startblock)),
        }
    }
}

/// Fixed-size nodes stored contiguously from `base_offset` on a device.
/// Node `n` lives at `base_offset + n * node_size`.
pub struct BlockNodeSource {
    device: Arc<dyn BlockDevice>,
    base_offset: u64,
    node_size: usize,
    node_count: u64,
}

impl fmt::Debug for BlockNodeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockNodeSource")
            .field("base_offset", &self.base_offset)
            .field("node_size", &self.node_size)
            .field("node_count", &self.node_count)
            .finish_non_exhaustive()
    }
}

impl BlockNodeSource {
    /// `node_count` nodes must fit on the device.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        base_offset: u64,
        node_size: usize,
        node_count: u64,
    ) -> Result<Self> {
        if node_size == 0 {
            return Err(PfsError::Format("node size must be non-zero".into()));
        }
        let end = (node_size as u64)
            .checked_mul(node_count)
            .and_then(|len| len.checked_add(base_offset))
            .ok_or_else(|| PfsError::Format("node region overflows".into()))?;
        if end > device.len_bytes() {
            return Err(PfsError::OutOfRange(format!(
                "{node_count} nodes of {node_size} bytes at {base_offset} exceed device of {} bytes",
                device.len_bytes()
            )));
        }
        Ok(Self {
            device,
            base_offset,
            node_size,
            node_count,
        })
    }
}

impl NodeSource for BlockNodeSource {
    fn read_node(&self, node: u64) -> Result<Arc<[u8]>> {
        if node >= self.node_count {
            return Err(PfsError::corruption(
                node,
                format!("node number beyond {} nodes", self.node_count),
            ));
        }
        let offset = self.base_offset + node * self.node_size as u64;
        let mut buf = vec![0_u8; self.node_size];
        read_bytes(self.device.as_ref(), offset, &mut buf)?;
        Ok(Arc::from(buf))
    }

    fn node_count(&self) -> u64 {
        self.node_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BTree;
    use crate::test_support::{build_abtb, records};
    use pfs_block::SectorBlockDevice;
    use std::ops::ControlFlow;

    #[test]
    fn tree_read_from_device() {
        let recs = records(60);
        let (nodes, root) = build_abtb(&recs, 512);
        let mut image = vec![0_u8; 4096];
        let base = 1024;
        for (i, node) in nodes.iter().enumerate() {
            image[base + i * 512..base + (i + 1) * 512].copy_from_slice(node);
        }
        let device: Arc<dyn BlockDevice> =
            Arc::new(SectorBlockDevice::from_bytes(image).expect("device"));
        let source =
            BlockNodeSource::new(device, base as u64, 512, nodes.len() as u64).expect("source");
        let tree = BTree::new(ShortFormFormat::by_block(512), source, Some(u64::from(root)));

        assert_eq!(tree.lookup(&recs[59]).expect("lookup"), Some(recs[59]));
        let mut total = 0_u64;
        tree.scan_all(|_, rec| {
            total += u64::from(rec.blockcount);
            ControlFlow::Continue(())
        })
        .expect("scan");
        let expected: u64 = recs.iter().map(|r| u64::from(r.blockcount)).sum();
        assert_eq!(total, expected);
    }

    #[test]
    fn node_region_must_fit_device() {
        let device: Arc<dyn BlockDevice> =
            Arc::new(SectorBlockDevice::from_bytes(vec![0; 1024]).expect("device"));
        assert!(BlockNodeSource::new(Arc::clone(&device), 512, 512, 2).is_err());
        let source = BlockNodeSource::new(device, 0, 512, 2).expect("fits");
        assert!(matches!(
            source.read_node(2),
            Err(PfsError::Corruption { block: 2, .. })
        ));
    }

    #[test]
    fn count_order_compares_length_first() {
        let format = ShortFormFormat::by_count(512);
        let small = XfsAllocRec {
            startblock: 900,
            blockcount: 1,
        };
        let large = XfsAllocRec {
            startblock: 10,
            blockcount: 8,
        };
        assert_eq!(format.compare(&small, &large), Ordering::Less);
        assert_eq!(
            ShortFormFormat::by_block(512).compare(&small, &large),
            Ordering::Greater
        );
        assert_eq!(format.magic(), ABTC_MAGIC);
    }

    #[test]
    fn header_rejects_overfull_leaf() {
        let (mut nodes, _) = build_abtb(&records(2), 64);
        let mut header = XfsShortBlockHeader::parse(&nodes[0]).expect("header");
        header.numrecs = 7;
        header.write_into(&mut nodes[0]).expect("write");
        let err = ShortFormFormat::by_block(64)
            .parse_header(&nodes[0])
            .expect_err("overfull");
        assert!(matches!(err, ParseError::InvalidField { field: "bb_numrecs", .. }));
    }
}
